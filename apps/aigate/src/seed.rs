use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rust_decimal::Decimal;
use serde::Deserialize;

use aigate_model::{Channel, Group, MemoryBalance, ModelCaches, ModelConfig};
use aigate_relay::AppState;

/// Boot-time configuration: channels, per-model prices, and billing groups.
#[derive(Debug, Deserialize)]
pub(crate) struct Seed {
    #[serde(default)]
    pub channels: Vec<SeedChannel>,
    #[serde(default)]
    pub model_configs: Vec<ModelConfig>,
    #[serde(default)]
    pub groups: Vec<SeedGroup>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SeedChannel {
    #[serde(flatten)]
    pub channel: Channel,
    /// Models this channel serves.
    pub models: Vec<String>,
    /// Availability sets the channel belongs to.
    pub sets: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SeedGroup {
    pub name: String,
    pub available_sets: Vec<String>,
    #[serde(default)]
    pub balance: Decimal,
    /// API keys resolving to this group.
    pub tokens: Vec<String>,
}

pub(crate) fn load(path: impl AsRef<Path>) -> anyhow::Result<Seed> {
    let path = path.as_ref();
    let raw = std::fs::read(path)
        .with_context(|| format!("read seed file {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse seed file {}", path.display()))
}

pub(crate) fn apply(state: &AppState, seed: Seed) {
    let mut caches = ModelCaches::new();
    let mut by_id: HashMap<i64, Arc<Channel>> = HashMap::new();
    for entry in seed.channels {
        let channel = Arc::new(entry.channel);
        by_id.insert(channel.id, channel.clone());
        for set in &entry.sets {
            caches.insert_set(
                set.clone(),
                entry
                    .models
                    .iter()
                    .map(|model| (model.clone(), channel.clone())),
            );
        }
    }
    state.apply_caches(caches, by_id);

    let model_configs = seed
        .model_configs
        .into_iter()
        .map(|config| (config.model.clone(), config))
        .collect();
    state.apply_model_configs(model_configs);

    let mut groups: HashMap<String, Arc<Group>> = HashMap::new();
    let mut tokens: HashMap<String, String> = HashMap::new();
    for entry in seed.groups {
        for token in &entry.tokens {
            tokens.insert(token.clone(), entry.name.clone());
        }
        groups.insert(
            entry.name.clone(),
            Arc::new(Group::new(
                entry.name,
                entry.available_sets,
                Arc::new(MemoryBalance::new(entry.balance)),
            )),
        );
    }
    state.apply_groups(groups, tokens);
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigate_common::GlobalConfig;
    use rust_decimal_macros::dec;

    fn config() -> GlobalConfig {
        GlobalConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            admin_key: "k".to_string(),
            retry_times: 3,
            billing_enabled: true,
            save_all_log_detail: false,
        }
    }

    #[test]
    fn seed_round_trips_into_state() {
        let raw = serde_json::json!({
            "channels": [{
                "id": 1,
                "channel_type": 1,
                "name": "openai-main",
                "status": "enabled",
                "priority": 20,
                "config": {"base_url": "https://api.openai.com", "api_key": "sk-up"},
                "models": ["gpt-4o"],
                "sets": ["default"]
            }],
            "model_configs": [{
                "model": "gpt-4o",
                "price": {"input_price": 2.5, "output_price": 10.0}
            }],
            "groups": [{
                "name": "acme",
                "available_sets": ["default"],
                "balance": 25.0,
                "tokens": ["sk-acme-1"]
            }]
        });
        let seed: Seed = serde_json::from_value(raw).unwrap();

        let state = AppState::new(config());
        apply(&state, seed);

        let group = state.authenticate("sk-acme-1").unwrap();
        assert_eq!(group.name, "acme");
        assert!(state.authenticate("sk-unknown").is_none());

        assert_eq!(state.channel(1).unwrap().name, "openai-main");
        assert_eq!(
            state.model_config("gpt-4o").unwrap().price.input_price,
            dec!(2.5)
        );
        assert_eq!(state.caches.load().channels("default", "gpt-4o").len(), 1);
    }
}
