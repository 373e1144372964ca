use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use aigate_model::{Channel, ModelCaches};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    /// The candidate list was empty before filtering: the caller's sets do
    /// not carry the model at all.
    #[error("channels not found")]
    ChannelsNotFound,
    /// Every candidate is disabled, ignored, or already tried.
    #[error("channels exhausted")]
    ChannelsExhausted,
}

fn filter_channels(channels: &[Arc<Channel>], ignore: &[i64]) -> Vec<Arc<Channel>> {
    channels
        .iter()
        .filter(|channel| channel.is_enabled())
        .filter(|channel| !ignore.contains(&channel.id))
        .cloned()
        .collect()
}

/// Inverting the clamped error rate boosts healthy channels while the 0.1
/// floor keeps every enabled channel at no more than a 10x advantage. A
/// channel with no observed rate gets the full boost.
fn effective_weight(channel: &Channel, error_rate: f64) -> u64 {
    let rate = error_rate.clamp(0.1, 1.0);
    (channel.priority() as f64 / rate) as u64
}

pub(crate) fn get_random_channel_with<R: Rng>(
    rng: &mut R,
    channels: &[Arc<Channel>],
    error_rates: &HashMap<i64, f64>,
    ignore: &[i64],
) -> Result<Arc<Channel>, SelectError> {
    if channels.is_empty() {
        return Err(SelectError::ChannelsNotFound);
    }

    let mut channels = filter_channels(channels, ignore);
    if channels.is_empty() {
        return Err(SelectError::ChannelsExhausted);
    }
    if channels.len() == 1 {
        return Ok(channels.swap_remove(0));
    }

    let weights: Vec<u64> = channels
        .iter()
        .map(|channel| {
            let rate = error_rates.get(&channel.id).copied().unwrap_or(0.0);
            effective_weight(channel, rate)
        })
        .collect();

    let total: u64 = weights.iter().sum();
    if total == 0 {
        let index = rng.random_range(0..channels.len());
        return Ok(channels[index].clone());
    }

    let mut roll = rng.random_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        if roll < *weight {
            return Ok(channels[index].clone());
        }
        roll -= weight;
    }

    let index = rng.random_range(0..channels.len());
    Ok(channels[index].clone())
}

/// Weighted random draw over `channels`, skipping disabled and ignored ids.
pub fn get_random_channel(
    channels: &[Arc<Channel>],
    error_rates: &HashMap<i64, f64>,
    ignore: &[i64],
) -> Result<Arc<Channel>, SelectError> {
    get_random_channel_with(&mut rand::rng(), channels, error_rates, ignore)
}

/// Union of the candidate channels across the caller's availability sets,
/// deduplicated by channel id so membership in several sets does not skew
/// the draw.
pub fn candidate_channels(
    caches: &ModelCaches,
    available_sets: &[String],
    model: &str,
) -> Vec<Arc<Channel>> {
    let mut by_id: HashMap<i64, Arc<Channel>> = HashMap::new();
    for set in available_sets {
        for channel in caches.channels(set, model) {
            by_id.entry(channel.id).or_insert_with(|| channel.clone());
        }
    }
    let mut out: Vec<Arc<Channel>> = by_id.into_values().collect();
    out.sort_by_key(|channel| channel.id);
    out
}

/// Initial-channel draw. When the ignore list (the entry banned set) leaves
/// nothing, retry once ignoring it: a fully banned pool still beats refusing
/// the request outright. Returns the candidate union for the retry loop.
pub fn get_channel_with_fallback(
    caches: &ModelCaches,
    available_sets: &[String],
    model: &str,
    error_rates: &HashMap<i64, f64>,
    ignore: &[i64],
) -> Result<(Arc<Channel>, Vec<Arc<Channel>>), SelectError> {
    let candidates = candidate_channels(caches, available_sets, model);
    match get_random_channel(&candidates, error_rates, ignore) {
        Ok(channel) => Ok((channel, candidates)),
        Err(SelectError::ChannelsExhausted) => {
            let channel = get_random_channel(&candidates, error_rates, &[])?;
            Ok((channel, candidates))
        }
        Err(err) => Err(err),
    }
}
