use serde::{Deserialize, Serialize};

/// Request family. Determines the price/usage computation bound at entry
/// and the endpoint the router exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    ChatCompletions,
    Completions,
    Embeddings,
    ImagesGenerations,
    Edits,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Rerank,
    ParsePdf,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::ChatCompletions => "chat_completions",
            Mode::Completions => "completions",
            Mode::Embeddings => "embeddings",
            Mode::ImagesGenerations => "images_generations",
            Mode::Edits => "edits",
            Mode::AudioSpeech => "audio_speech",
            Mode::AudioTranscription => "audio_transcription",
            Mode::AudioTranslation => "audio_translation",
            Mode::Rerank => "rerank",
            Mode::ParsePdf => "parse_pdf",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
