use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::Channel;

/// Read-mostly snapshot mapping availability set → model name → channels.
///
/// Built once from the seed (or a config reload) and swapped in whole;
/// request handling only ever reads one consistent snapshot.
#[derive(Debug, Default, Clone)]
pub struct ModelCaches {
    enabled_by_set: HashMap<String, HashMap<String, Vec<Arc<Channel>>>>,
}

impl ModelCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `channels` under `set` by every model name they serve.
    /// Disabled channels are left out so selection never sees them.
    pub fn insert_set<I>(&mut self, set: impl Into<String>, entries: I)
    where
        I: IntoIterator<Item = (String, Arc<Channel>)>,
    {
        let by_model = self.enabled_by_set.entry(set.into()).or_default();
        for (model, channel) in entries {
            if !channel.is_enabled() {
                continue;
            }
            by_model.entry(model).or_default().push(channel);
        }
    }

    pub fn channels(&self, set: &str, model: &str) -> &[Arc<Channel>] {
        self.enabled_by_set
            .get(set)
            .and_then(|by_model| by_model.get(model))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn sets(&self) -> impl Iterator<Item = &str> {
        self.enabled_by_set.keys().map(String::as_str)
    }

    /// All distinct models reachable through any set. Admin surface only.
    pub fn models(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .enabled_by_set
            .values()
            .flat_map(|by_model| by_model.keys().cloned())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}
