use serde::{Deserialize, Serialize};

/// Weight used when a channel row does not configure one.
pub const DEFAULT_PRIORITY: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    Disabled,
    /// Disabled by the health monitor rather than an operator.
    AutoDisabled,
}

/// A configured upstream endpoint capable of serving one or more models.
///
/// `config` is opaque to the dispatch core; the handler interprets it
/// (base URL, key, model remaps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    /// Provider kind tag. Only used for operator-facing labels.
    pub channel_type: i32,
    pub name: String,
    pub status: ChannelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Channel {
    pub fn priority(&self) -> i32 {
        match self.priority {
            Some(p) if p > 0 => p,
            _ => DEFAULT_PRIORITY,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }
}
