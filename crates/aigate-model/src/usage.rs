use serde::{Deserialize, Serialize};

/// Token usage for one attempt. Estimated at admission, authoritative once
/// parsed out of the upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub cached_tokens: i64,
}

impl Usage {
    pub fn from_input(input_tokens: i64) -> Self {
        Self {
            input_tokens,
            total_tokens: input_tokens,
            ..Default::default()
        }
    }
}
