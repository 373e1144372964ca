//! Per-(channel, model) health statistics consumed by the dispatch core.
//!
//! The core reads banned sets and error rates once at request entry and
//! reports every attempt outcome back through `add_request`. Monitor
//! failures never fail a request; callers log and move on.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

pub use memory::{MemoryMonitor, MonitorConfig};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("monitor store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of recording one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFeedback {
    /// Failure rate crossed the alerting threshold without a ban.
    pub beyond_threshold: bool,
    /// This call transitioned the channel into the auto-banned state.
    pub ban_executed: bool,
}

#[async_trait]
pub trait Monitor: Send + Sync {
    /// Channels currently auto-banned for `model`.
    async fn banned_channels(&self, model: &str) -> Result<Vec<i64>, MonitorError>;

    /// Observed error rate per channel for `model`, in `[0, 1]`. Channels
    /// without enough samples are absent.
    async fn error_rates(&self, model: &str) -> Result<HashMap<i64, f64>, MonitorError>;

    /// Record one attempt. Called after every attempt, success or failure.
    async fn add_request(
        &self,
        model: &str,
        channel_id: i64,
        failed: bool,
        no_permission: bool,
    ) -> Result<RequestFeedback, MonitorError>;
}
