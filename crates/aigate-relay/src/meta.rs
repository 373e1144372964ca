use std::sync::Arc;

use aigate_model::{Channel, Mode};

/// Per-attempt envelope. A fresh `RequestMeta` is built for every attempt;
/// nothing mutates it after the channel is bound.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub group: String,
    pub mode: Mode,
    pub channel: Arc<Channel>,
    pub origin_model: String,
    /// Model name sent upstream after the channel remap.
    pub actual_model: String,
    /// Admission-time estimate, carried across retries.
    pub input_tokens: i64,
    pub client_ip: String,
}

impl RequestMeta {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: impl Into<String>,
        group: impl Into<String>,
        mode: Mode,
        channel: Arc<Channel>,
        origin_model: impl Into<String>,
        actual_model: impl Into<String>,
        input_tokens: i64,
        client_ip: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            group: group.into(),
            mode,
            channel,
            origin_model: origin_model.into(),
            actual_model: actual_model.into(),
            input_tokens,
            client_ip: client_ip.into(),
        }
    }
}
