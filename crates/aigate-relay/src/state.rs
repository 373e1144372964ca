use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use aigate_common::GlobalConfig;
use aigate_model::{Channel, Group, ModelCaches, ModelConfig};

/// Process-wide state read by the relay engine.
///
/// Every field is an `ArcSwap` snapshot: requests load once at entry and
/// never observe a partial reload.
pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub caches: ArcSwap<ModelCaches>,
    pub channels: ArcSwap<HashMap<i64, Arc<Channel>>>,
    pub groups: ArcSwap<HashMap<String, Arc<Group>>>,
    /// API key → group name.
    pub tokens: ArcSwap<HashMap<String, String>>,
    pub model_configs: ArcSwap<HashMap<String, ModelConfig>>,
}

impl AppState {
    pub fn new(global: GlobalConfig) -> Self {
        Self {
            global: ArcSwap::from_pointee(global),
            caches: ArcSwap::from_pointee(ModelCaches::new()),
            channels: ArcSwap::from_pointee(HashMap::new()),
            groups: ArcSwap::from_pointee(HashMap::new()),
            tokens: ArcSwap::from_pointee(HashMap::new()),
            model_configs: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn apply_caches(&self, caches: ModelCaches, channels: HashMap<i64, Arc<Channel>>) {
        self.caches.store(Arc::new(caches));
        self.channels.store(Arc::new(channels));
    }

    pub fn apply_groups(
        &self,
        groups: HashMap<String, Arc<Group>>,
        tokens: HashMap<String, String>,
    ) {
        self.groups.store(Arc::new(groups));
        self.tokens.store(Arc::new(tokens));
    }

    pub fn apply_model_configs(&self, configs: HashMap<String, ModelConfig>) {
        self.model_configs.store(Arc::new(configs));
    }

    pub fn authenticate(&self, token: &str) -> Option<Arc<Group>> {
        let group_name = self.tokens.load().get(token).cloned()?;
        self.groups.load().get(&group_name).cloned()
    }

    pub fn channel(&self, id: i64) -> Option<Arc<Channel>> {
        self.channels.load().get(&id).cloned()
    }

    pub fn model_config(&self, model: &str) -> Option<ModelConfig> {
        self.model_configs.load().get(model).cloned()
    }
}
