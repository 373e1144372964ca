use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{error, warn};

/// Process-wide operator notifications with per-key rate limiting.
///
/// Entries expire with their own interval and are pruned on every check, so
/// the map stays bounded by the set of keys active inside one interval.
#[derive(Debug, Default)]
pub struct Notifier {
    last_fired: Mutex<HashMap<String, (Instant, Duration)>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn should_fire(&self, key: &str, interval: Duration) -> bool {
        let now = Instant::now();
        let mut last_fired = self.last_fired.lock().unwrap_or_else(|e| e.into_inner());
        last_fired.retain(|_, (fired, ttl)| now.duration_since(*fired) < *ttl);

        if last_fired.contains_key(key) {
            return false;
        }
        last_fired.insert(key.to_string(), (now, interval));
        true
    }

    pub fn error_throttle(&self, key: &str, interval: Duration, title: &str, payload: &str) {
        if self.should_fire(key, interval) {
            error!(event = "notify", key = %key, payload = %payload, "{title}");
        }
    }

    pub fn warn_throttle(&self, key: &str, interval: Duration, title: &str, payload: &str) {
        if self.should_fire(key, interval) {
            warn!(event = "notify", key = %key, payload = %payload, "{title}");
        }
    }
}
