use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, header};
use serde::Deserialize;

use aigate_model::{Mode, Usage};

use crate::handler::{HandleResult, RelayError, RelayHandler, RequestDetail, UpstreamResponse};
use crate::meta::RequestMeta;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection details a channel's opaque config must carry for the shared
/// handler.
#[derive(Debug, Deserialize)]
struct ChannelEndpoint {
    base_url: String,
    #[serde(default)]
    api_key: Option<String>,
}

fn upstream_path(mode: Mode) -> &'static str {
    match mode {
        Mode::ChatCompletions => "/v1/chat/completions",
        Mode::Completions => "/v1/completions",
        Mode::Embeddings => "/v1/embeddings",
        Mode::ImagesGenerations => "/v1/images/generations",
        Mode::Edits => "/v1/edits",
        Mode::AudioSpeech => "/v1/audio/speech",
        Mode::AudioTranscription => "/v1/audio/transcriptions",
        Mode::AudioTranslation => "/v1/audio/translations",
        Mode::Rerank => "/v1/rerank",
        Mode::ParsePdf => "/v1/pdf/parse",
    }
}

/// Swap the requested model name for the channel's remap before forwarding.
/// Non-JSON bodies pass through untouched.
fn rewrite_model(body: &Bytes, actual_model: &str) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return body.clone();
    };
    let Some(object) = value.as_object_mut() else {
        return body.clone();
    };
    if object.get("model").and_then(|m| m.as_str()) == Some(actual_model) {
        return body.clone();
    }
    object.insert(
        "model".to_string(),
        serde_json::Value::String(actual_model.to_string()),
    );
    Bytes::from(value.to_string())
}

/// Pull token usage out of an OpenAI-shaped response body.
fn parse_usage(body: &[u8], fallback_input: i64) -> Usage {
    let Some(usage) = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("usage").cloned())
    else {
        return Usage::from_input(fallback_input);
    };

    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| usage.get(name).and_then(|v| v.as_i64()))
            .unwrap_or(0)
    };
    let input_tokens = field(&["prompt_tokens", "input_tokens"]);
    let output_tokens = field(&["completion_tokens", "output_tokens"]);
    let total_tokens = match field(&["total_tokens"]) {
        0 => input_tokens + output_tokens,
        total => total,
    };

    Usage {
        input_tokens,
        output_tokens,
        total_tokens,
        cached_tokens: field(&["cached_tokens"]),
    }
}

fn error_from_body(status: StatusCode, body: &[u8]) -> RelayError {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(payload) if payload.is_object() => RelayError::new(status, payload),
        _ => RelayError::from_message(
            status,
            "upstream_error",
            "upstream_error",
            String::from_utf8_lossy(body).into_owned(),
        ),
    }
}

fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if name == header::TRANSFER_ENCODING
            || name == header::CONTENT_LENGTH
            || name == header::CONNECTION
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// The shared mode handler: forwards the buffered request to the channel's
/// endpoint verbatim (apart from the model remap) and reads the whole
/// response back.
pub struct PassthroughHandler {
    client: reqwest::Client,
}

impl PassthroughHandler {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RelayHandler for PassthroughHandler {
    async fn handle(&self, meta: &RequestMeta, body: Bytes) -> HandleResult {
        let endpoint: ChannelEndpoint = match serde_json::from_value(meta.channel.config.clone()) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                return HandleResult::failure(RelayError::from_message(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "aigate_error",
                    "invalid_channel_config",
                    format!("channel {} config invalid: {err}", meta.channel.id),
                ));
            }
        };

        let url = format!(
            "{}{}",
            endpoint.base_url.trim_end_matches('/'),
            upstream_path(meta.mode)
        );
        let outbound = rewrite_model(&body, &meta.actual_model);
        let request_detail = String::from_utf8_lossy(&outbound).into_owned();

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(outbound);
        if let Some(api_key) = endpoint.api_key.as_deref() {
            request = request.bearer_auth(api_key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                return HandleResult {
                    detail: Some(RequestDetail {
                        request_body: request_detail,
                        response_body: String::new(),
                    }),
                    ..HandleResult::failure(RelayError::from_message(
                        StatusCode::BAD_GATEWAY,
                        "upstream_error",
                        "upstream_unreachable",
                        err.to_string(),
                    ))
                };
            }
        };

        let status = response.status();
        let headers = response_headers(response.headers());
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                return HandleResult {
                    detail: Some(RequestDetail {
                        request_body: request_detail,
                        response_body: String::new(),
                    }),
                    ..HandleResult::failure(RelayError::from_message(
                        StatusCode::BAD_GATEWAY,
                        "upstream_error",
                        "upstream_body_read_failed",
                        err.to_string(),
                    ))
                };
            }
        };

        let detail = Some(RequestDetail {
            request_body: request_detail,
            response_body: String::from_utf8_lossy(&body).into_owned(),
        });

        if !status.is_success() {
            return HandleResult {
                detail,
                ..HandleResult::failure(error_from_body(status, &body))
            };
        }

        HandleResult {
            usage: parse_usage(&body, meta.input_tokens),
            detail,
            response: Some(UpstreamResponse {
                status,
                headers,
                body,
            }),
            error: None,
        }
    }
}
