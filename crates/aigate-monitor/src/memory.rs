use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{Monitor, MonitorError, RequestFeedback};

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Sliding window the statistics cover.
    pub window: Duration,
    /// Samples required inside the window before an error rate is reported.
    pub min_samples: usize,
    /// Failure rate above which `beyond_threshold` fires.
    pub error_rate_threshold: f64,
    /// No-permission failures inside the window that execute a ban.
    pub ban_after_no_permission: usize,
    /// How long an executed ban holds before the channel re-enters selection.
    pub ban_duration: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            min_samples: 10,
            error_rate_threshold: 0.5,
            ban_after_no_permission: 3,
            ban_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelModelStats {
    /// (observed at, failed) per attempt, oldest first.
    samples: VecDeque<(Instant, bool)>,
    /// No-permission failure instants, oldest first.
    no_permission: VecDeque<Instant>,
    banned_until: Option<Instant>,
}

impl ChannelModelStats {
    fn prune(&mut self, now: Instant, window: Duration) {
        // checked_sub: the clock may not reach back a full window early in
        // the process lifetime.
        let Some(horizon) = now.checked_sub(window) else {
            return;
        };
        while self
            .samples
            .front()
            .is_some_and(|(at, _)| *at < horizon)
        {
            self.samples.pop_front();
        }
        while self.no_permission.front().is_some_and(|at| *at < horizon) {
            self.no_permission.pop_front();
        }
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| until > now)
    }

    fn error_rate(&self, min_samples: usize) -> Option<f64> {
        if self.samples.len() < min_samples {
            return None;
        }
        let failed = self.samples.iter().filter(|(_, failed)| *failed).count();
        Some(failed as f64 / self.samples.len() as f64)
    }
}

/// In-process monitor backing `banned_channels`/`error_rates` reads with a
/// sliding window per (model, channel).
///
/// Bans carry an expiry instead of being removed by a sweeper: a banned
/// channel silently recovers once `ban_duration` elapses, which gives the
/// auto-ban its hysteresis.
pub struct MemoryMonitor {
    config: MonitorConfig,
    stats: RwLock<HashMap<(String, i64), ChannelModelStats>>,
}

impl MemoryMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            stats: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

#[async_trait]
impl Monitor for MemoryMonitor {
    async fn banned_channels(&self, model: &str) -> Result<Vec<i64>, MonitorError> {
        let now = Instant::now();
        let stats = self.stats.read().await;
        let mut out: Vec<i64> = stats
            .iter()
            .filter(|((m, _), entry)| m == model && entry.is_banned(now))
            .map(|((_, channel_id), _)| *channel_id)
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    async fn error_rates(&self, model: &str) -> Result<HashMap<i64, f64>, MonitorError> {
        let stats = self.stats.read().await;
        Ok(stats
            .iter()
            .filter(|((m, _), _)| m == model)
            .filter_map(|((_, channel_id), entry)| {
                entry
                    .error_rate(self.config.min_samples)
                    .map(|rate| (*channel_id, rate))
            })
            .collect())
    }

    async fn add_request(
        &self,
        model: &str,
        channel_id: i64,
        failed: bool,
        no_permission: bool,
    ) -> Result<RequestFeedback, MonitorError> {
        let now = Instant::now();
        let mut stats = self.stats.write().await;
        let entry = stats
            .entry((model.to_string(), channel_id))
            .or_default();
        entry.prune(now, self.config.window);
        entry.samples.push_back((now, failed));

        let mut feedback = RequestFeedback::default();
        if failed && no_permission {
            entry.no_permission.push_back(now);
            if entry.no_permission.len() >= self.config.ban_after_no_permission
                && !entry.is_banned(now)
            {
                entry.banned_until = Some(now + self.config.ban_duration);
                feedback.ban_executed = true;
            }
        }

        if !feedback.ban_executed
            && let Some(rate) = entry.error_rate(self.config.min_samples)
            && rate > self.config.error_rate_threshold
        {
            feedback.beyond_threshold = true;
        }

        Ok(feedback)
    }
}
