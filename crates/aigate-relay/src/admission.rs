use bytes::Bytes;
use rust_decimal::Decimal;

use aigate_model::{Mode, ModelConfig, PRICE_UNIT, Price, Usage};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid request body: {0}")]
    InvalidRequest(String),
}

pub type PriceFn = fn(&ModelConfig) -> Result<Price, AdmissionError>;
pub type UsageFn = fn(&Bytes, &ModelConfig) -> Result<Usage, AdmissionError>;

/// Price/usage pair bound per mode, mirrored by the admission gate: the
/// price scales the estimate into the pre-consumed amount checked against
/// the group balance.
#[derive(Clone, Copy)]
pub struct ModeBilling {
    pub price: Option<PriceFn>,
    pub usage: Option<UsageFn>,
}

impl ModeBilling {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::ChatCompletions => Self {
                price: Some(model_price),
                usage: Some(chat_request_usage),
            },
            Mode::Completions => Self {
                price: Some(model_price),
                usage: Some(completions_request_usage),
            },
            Mode::Embeddings => Self {
                price: Some(model_price),
                usage: Some(embeddings_request_usage),
            },
            Mode::Rerank => Self {
                price: Some(model_price),
                usage: Some(rerank_request_usage),
            },
            Mode::AudioSpeech => Self {
                price: Some(model_price),
                usage: Some(speech_request_usage),
            },
            Mode::ImagesGenerations | Mode::Edits => Self {
                price: Some(model_price),
                usage: Some(image_request_usage),
            },
            // Uploaded-media modes have no prompt to estimate; admission
            // passes and the response usage settles the bill.
            Mode::AudioTranscription | Mode::AudioTranslation | Mode::ParsePdf => Self {
                price: Some(model_price),
                usage: Some(no_request_usage),
            },
        }
    }
}

/// `input_tokens x input_price / PRICE_UNIT`. The amount stays `Decimal`
/// so boundary comparisons against the balance are exact.
pub fn pre_consumed_amount(usage: &Usage, price: &Price) -> Decimal {
    if usage.input_tokens == 0 || price.input_price.is_zero() {
        return Decimal::ZERO;
    }
    Decimal::from(usage.input_tokens) * price.input_price / Decimal::from(PRICE_UNIT)
}

fn model_price(config: &ModelConfig) -> Result<Price, AdmissionError> {
    Ok(config.price)
}

fn parse_body(body: &Bytes) -> Result<serde_json::Value, AdmissionError> {
    serde_json::from_slice(body).map_err(|err| AdmissionError::InvalidRequest(err.to_string()))
}

/// Rough token estimate for admission only; roughly four bytes of text per
/// token. The authoritative count comes back with the response.
fn estimate_tokens(text_bytes: usize) -> i64 {
    (text_bytes / 4) as i64
}

fn chat_request_usage(body: &Bytes, _config: &ModelConfig) -> Result<Usage, AdmissionError> {
    let value = parse_body(body)?;
    let messages = value
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| AdmissionError::InvalidRequest("messages missing".to_string()))?;

    let mut text_bytes = 0;
    for message in messages {
        match message.get("content") {
            Some(serde_json::Value::String(content)) => text_bytes += content.len(),
            Some(serde_json::Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        text_bytes += text.len();
                    }
                }
            }
            _ => {}
        }
    }
    Ok(Usage::from_input(estimate_tokens(text_bytes)))
}

fn completions_request_usage(body: &Bytes, _config: &ModelConfig) -> Result<Usage, AdmissionError> {
    let value = parse_body(body)?;
    let text_bytes = match value.get("prompt") {
        Some(serde_json::Value::String(prompt)) => prompt.len(),
        Some(serde_json::Value::Array(prompts)) => prompts
            .iter()
            .filter_map(|p| p.as_str())
            .map(str::len)
            .sum(),
        _ => 0,
    };
    Ok(Usage::from_input(estimate_tokens(text_bytes)))
}

fn embeddings_request_usage(body: &Bytes, _config: &ModelConfig) -> Result<Usage, AdmissionError> {
    let value = parse_body(body)?;
    let text_bytes = match value.get("input") {
        Some(serde_json::Value::String(input)) => input.len(),
        Some(serde_json::Value::Array(inputs)) => inputs
            .iter()
            .filter_map(|i| i.as_str())
            .map(str::len)
            .sum(),
        _ => 0,
    };
    Ok(Usage::from_input(estimate_tokens(text_bytes)))
}

fn rerank_request_usage(body: &Bytes, _config: &ModelConfig) -> Result<Usage, AdmissionError> {
    let value = parse_body(body)?;
    let query_bytes = value
        .get("query")
        .and_then(|q| q.as_str())
        .map(str::len)
        .unwrap_or(0);
    let document_bytes: usize = value
        .get("documents")
        .and_then(|d| d.as_array())
        .map(|documents| {
            documents
                .iter()
                .filter_map(|d| d.as_str())
                .map(str::len)
                .sum()
        })
        .unwrap_or(0);
    Ok(Usage::from_input(estimate_tokens(query_bytes + document_bytes)))
}

fn speech_request_usage(body: &Bytes, _config: &ModelConfig) -> Result<Usage, AdmissionError> {
    let value = parse_body(body)?;
    // TTS is billed on input characters.
    let chars = value
        .get("input")
        .and_then(|i| i.as_str())
        .map(|input| input.chars().count())
        .unwrap_or(0);
    Ok(Usage::from_input(chars as i64))
}

fn image_request_usage(body: &Bytes, _config: &ModelConfig) -> Result<Usage, AdmissionError> {
    let value = parse_body(body)?;
    let count = value.get("n").and_then(|n| n.as_i64()).unwrap_or(1).max(1);
    Ok(Usage::from_input(count))
}

fn no_request_usage(_body: &Bytes, _config: &ModelConfig) -> Result<Usage, AdmissionError> {
    Ok(Usage::default())
}
