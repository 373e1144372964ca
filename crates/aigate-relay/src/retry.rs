use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use aigate_model::{Channel, Price};

use crate::attempt::{channel_has_permission, should_delay};
use crate::engine::{RelayEngine, RelayRequest};
use crate::handler::HandleResult;
use crate::meta::RequestMeta;
use crate::select::{SelectError, get_random_channel};

/// Outcome of the entry-time channel resolution.
pub(crate) struct InitialChannel {
    pub channel: Arc<Channel>,
    pub designated: bool,
    pub ignore_channel_ids: Vec<i64>,
    pub error_rates: HashMap<i64, f64>,
    pub migrated_channels: Vec<Arc<Channel>>,
}

/// Request-scoped retry state.
///
/// `ignore_channel_ids` only ever grows and `exhausted` never reverts;
/// `retry_times` may grow when a no-permission attempt is forgiven.
pub(crate) struct RetryState {
    retry_times: u32,
    last_permission_channel: Option<Arc<Channel>>,
    ignore_channel_ids: Vec<i64>,
    error_rates: HashMap<i64, f64>,
    exhausted: bool,

    meta: Option<RequestMeta>,
    result: Option<HandleResult>,
    price: Price,
    input_tokens: i64,
    migrated_channels: Vec<Arc<Channel>>,
}

pub(crate) fn init_retry_state(
    retry_times: u32,
    initial: &InitialChannel,
    meta: RequestMeta,
    result: HandleResult,
    price: Price,
) -> RetryState {
    let input_tokens = meta.input_tokens;
    let mut state = RetryState {
        retry_times,
        last_permission_channel: None,
        ignore_channel_ids: initial.ignore_channel_ids.clone(),
        error_rates: initial.error_rates.clone(),
        exhausted: initial.designated,
        meta: Some(meta),
        result: None,
        price,
        input_tokens,
        migrated_channels: initial.migrated_channels.clone(),
    };

    match result.error_status() {
        Some(status) if !channel_has_permission(status) => {
            state.ignore_channel_ids.push(initial.channel.id);
        }
        _ => state.last_permission_channel = Some(initial.channel.clone()),
    }
    state.result = Some(result);
    state
}

/// 1 + U[0,1) seconds before re-hitting a rate-limited channel.
async fn rate_limit_backoff() {
    let jitter: f64 = rand::rng().random();
    tokio::time::sleep(Duration::from_secs_f64(1.0 + jitter)).await;
}

async fn get_retry_channel(state: &mut RetryState) -> Result<Arc<Channel>, SelectError> {
    let last_status = state.result.as_ref().and_then(HandleResult::error_status);
    let delay = last_status.is_some_and(should_delay);

    if state.exhausted {
        let Some(channel) = state.last_permission_channel.clone() else {
            return Err(SelectError::ChannelsExhausted);
        };
        if delay {
            rate_limit_backoff().await;
        }
        return Ok(channel);
    }

    match get_random_channel(
        &state.migrated_channels,
        &state.error_rates,
        &state.ignore_channel_ids,
    ) {
        Ok(channel) => Ok(channel),
        Err(SelectError::ChannelsExhausted) => {
            let Some(channel) = state.last_permission_channel.clone() else {
                return Err(SelectError::ChannelsExhausted);
            };
            state.exhausted = true;
            if delay {
                rate_limit_backoff().await;
            }
            Ok(channel)
        }
        Err(err) => Err(err),
    }
}

fn handle_retry_result(
    cancel: &CancellationToken,
    retry: bool,
    new_channel: &Arc<Channel>,
    state: &mut RetryState,
) -> bool {
    if cancel.is_cancelled() {
        return true;
    }
    let Some(status) = state.result.as_ref().and_then(HandleResult::error_status) else {
        return true;
    };
    if !retry {
        return true;
    }

    if state.exhausted {
        if !channel_has_permission(status) {
            return true;
        }
    } else if !channel_has_permission(status) {
        state.ignore_channel_ids.push(new_channel.id);
        // No-permission attempts are not charged against the retry budget;
        // the channel is ignored from here on.
        state.retry_times += 1;
    } else {
        state.last_permission_channel = Some(new_channel.clone());
    }

    false
}

/// Drive retries until success, exhaustion, cancellation, or an empty
/// budget. Every attempt is flushed to the recorder exactly once; only the
/// final attempt carries `downstream_result = true`.
pub(crate) async fn retry_loop(
    engine: &RelayEngine,
    req: &RelayRequest,
    mut state: RetryState,
) -> HandleResult {
    let mut i: u32 = 0;

    loop {
        let channel = match get_retry_channel(&mut state).await {
            Ok(channel) => channel,
            Err(err) => {
                if err != SelectError::ChannelsExhausted {
                    warn!(event = "retry_select_failed", request_id = %req.request_id, error = %err);
                }
                if let (Some(meta), Some(result)) = (state.meta.as_ref(), state.result.as_ref()) {
                    engine.record_result(req, meta, &state.price, result, i, true);
                }
                break;
            }
        };

        // Flush the prior attempt before binding the new meta; its response
        // is not the one the client will see.
        if let (Some(meta), Some(result)) = (state.meta.take(), state.result.take()) {
            engine.record_result(req, &meta, &state.price, &result, i, false);
        }

        warn!(
            event = "retry",
            request_id = %req.request_id,
            retry = i + 1,
            channel_id = channel.id,
            channel_name = %channel.name,
            remaining = state.retry_times - i,
        );

        let meta = engine.build_meta(req, channel.clone(), state.input_tokens);
        let (result, retry) = engine.attempt(&meta, req.body.clone(), &req.cancel).await;
        state.meta = Some(meta);
        state.result = Some(result);

        let done = handle_retry_result(&req.cancel, retry, &channel, &mut state);
        if done || i + 1 == state.retry_times {
            if let (Some(meta), Some(result)) = (state.meta.as_ref(), state.result.as_ref()) {
                engine.record_result(req, meta, &state.price, result, i + 1, true);
            }
            break;
        }

        i += 1;
    }

    state.result.take().unwrap_or_else(|| {
        HandleResult::failure(crate::engine::saturated_error())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigate_model::ChannelStatus;
    use http::StatusCode;

    use crate::handler::RelayError;

    fn channel(id: i64) -> Arc<Channel> {
        Arc::new(Channel {
            id,
            channel_type: 1,
            name: format!("ch-{id}"),
            status: ChannelStatus::Enabled,
            priority: None,
            config: serde_json::Value::Null,
        })
    }

    fn failure(status: StatusCode) -> HandleResult {
        HandleResult::failure(RelayError::from_message(status, "upstream_error", "err", "boom"))
    }

    fn meta_for(ch: &Arc<Channel>) -> RequestMeta {
        RequestMeta::new(
            "req",
            "g",
            aigate_model::Mode::ChatCompletions,
            ch.clone(),
            "m",
            "m",
            0,
            "",
        )
    }

    fn initial(ch: &Arc<Channel>, designated: bool, migrated: Vec<Arc<Channel>>) -> InitialChannel {
        InitialChannel {
            channel: ch.clone(),
            designated,
            ignore_channel_ids: Vec::new(),
            error_rates: HashMap::new(),
            migrated_channels: migrated,
        }
    }

    #[test]
    fn designated_channel_starts_exhausted() {
        let ch = channel(1);
        let state = init_retry_state(
            2,
            &initial(&ch, true, vec![]),
            meta_for(&ch),
            failure(StatusCode::INTERNAL_SERVER_ERROR),
            Price::default(),
        );
        assert!(state.exhausted);
        assert_eq!(state.last_permission_channel.as_ref().map(|c| c.id), Some(1));
    }

    #[test]
    fn no_permission_first_attempt_is_ignored_not_remembered() {
        let ch = channel(1);
        let state = init_retry_state(
            2,
            &initial(&ch, false, vec![ch.clone()]),
            meta_for(&ch),
            failure(StatusCode::FORBIDDEN),
            Price::default(),
        );
        assert!(!state.exhausted);
        assert_eq!(state.ignore_channel_ids, vec![1]);
        assert!(state.last_permission_channel.is_none());
    }

    #[test]
    fn no_permission_retry_forgives_the_budget() {
        let cancel = CancellationToken::new();
        let a = channel(1);
        let b = channel(2);
        let mut state = init_retry_state(
            1,
            &initial(&a, false, vec![a.clone(), b.clone()]),
            meta_for(&a),
            failure(StatusCode::INTERNAL_SERVER_ERROR),
            Price::default(),
        );

        state.result = Some(failure(StatusCode::NOT_FOUND));
        let done = handle_retry_result(&cancel, true, &b, &mut state);
        assert!(!done);
        assert_eq!(state.retry_times, 2);
        assert_eq!(state.ignore_channel_ids, vec![2]);
        // ignore list only grows
        state.result = Some(failure(StatusCode::UNAUTHORIZED));
        handle_retry_result(&cancel, true, &channel(3), &mut state);
        assert_eq!(state.ignore_channel_ids, vec![2, 3]);
    }

    #[test]
    fn exhausted_no_permission_terminates() {
        let cancel = CancellationToken::new();
        let a = channel(1);
        let mut state = init_retry_state(
            3,
            &initial(&a, true, vec![]),
            meta_for(&a),
            failure(StatusCode::INTERNAL_SERVER_ERROR),
            Price::default(),
        );
        state.result = Some(failure(StatusCode::FORBIDDEN));
        assert!(handle_retry_result(&cancel, true, &a, &mut state));
    }

    #[test]
    fn cancellation_terminates() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let a = channel(1);
        let mut state = init_retry_state(
            3,
            &initial(&a, false, vec![a.clone()]),
            meta_for(&a),
            failure(StatusCode::INTERNAL_SERVER_ERROR),
            Price::default(),
        );
        assert!(handle_retry_result(&cancel, true, &a, &mut state));
    }

    #[tokio::test]
    async fn exhausted_without_fallback_reports_exhaustion() {
        let a = channel(1);
        let mut state = init_retry_state(
            3,
            &initial(&a, true, vec![]),
            meta_for(&a),
            failure(StatusCode::FORBIDDEN),
            Price::default(),
        );
        // 403 on the designated channel leaves no permissioned fallback.
        let err = get_retry_channel(&mut state).await.unwrap_err();
        assert_eq!(err, SelectError::ChannelsExhausted);
    }

    #[tokio::test]
    async fn selector_exhaustion_falls_back_to_last_permission_channel() {
        let a = channel(1);
        let mut state = init_retry_state(
            3,
            &initial(&a, false, vec![a.clone()]),
            meta_for(&a),
            failure(StatusCode::INTERNAL_SERVER_ERROR),
            Price::default(),
        );
        state.ignore_channel_ids.push(1);

        let picked = get_retry_channel(&mut state).await.unwrap();
        assert_eq!(picked.id, 1);
        assert!(state.exhausted);
    }
}
