use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use aigate_model::Usage;

use crate::meta::RequestMeta;

/// Upstream error carried through the core untouched. The payload is the
/// provider's error JSON; aigate forwards it verbatim apart from the
/// request-id decoration on the final response.
#[derive(Debug, Clone)]
pub struct RelayError {
    pub status: StatusCode,
    pub payload: serde_json::Value,
}

impl RelayError {
    pub fn new(status: StatusCode, payload: serde_json::Value) -> Self {
        Self { status, payload }
    }

    /// OpenAI-shaped error body for failures aigate originates itself.
    pub fn from_message(
        status: StatusCode,
        error_type: &str,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            payload: serde_json::json!({
                "error": {
                    "message": message.into(),
                    "type": error_type,
                    "code": code,
                }
            }),
        }
    }

    pub fn json_or_empty(&self) -> String {
        if self.payload.is_null() {
            return String::new();
        }
        self.payload.to_string()
    }

    /// Append the correlation id to the client-visible message, creating the
    /// error envelope when the upstream payload has none.
    pub fn decorate_request_id(&mut self, request_id: &str) {
        let error = self
            .payload
            .as_object_mut()
            .map(|object| object.entry("error").or_insert_with(|| serde_json::json!({})));
        let Some(serde_json::Value::Object(error)) = error else {
            return;
        };
        let message = match error.get("message").and_then(|m| m.as_str()) {
            Some(existing) => format!("{existing} (request id: {request_id})"),
            None => format!("(request id: {request_id})"),
        };
        error.insert("message".to_string(), serde_json::Value::String(message));
    }
}

/// Buffered upstream response surfaced to the client on success.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Request/response bodies retained for the consumption log.
#[derive(Debug, Clone, Default)]
pub struct RequestDetail {
    pub request_body: String,
    pub response_body: String,
}

/// Outcome of one handler invocation against a bound channel.
#[derive(Debug, Clone, Default)]
pub struct HandleResult {
    /// Present on success; the body the client receives.
    pub response: Option<UpstreamResponse>,
    pub usage: Usage,
    pub detail: Option<RequestDetail>,
    pub error: Option<RelayError>,
}

impl HandleResult {
    pub fn failure(error: RelayError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn error_status(&self) -> Option<StatusCode> {
        self.error.as_ref().map(|error| error.status)
    }
}

/// Mode-shared delegate that forwards one bound attempt upstream.
///
/// Implementations interpret the channel config and yield a `HandleResult`;
/// they never retry or touch health state themselves.
#[async_trait]
pub trait RelayHandler: Send + Sync {
    async fn handle(&self, meta: &RequestMeta, body: Bytes) -> HandleResult;
}
