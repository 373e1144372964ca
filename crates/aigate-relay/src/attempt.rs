use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::error;

use aigate_monitor::{Monitor, RequestFeedback};

use crate::handler::{HandleResult, RelayError, RelayHandler};
use crate::meta::RequestMeta;
use crate::notify::Notifier;

const NOTIFY_INTERVAL: Duration = Duration::from_secs(60);

/// 400/413 mean the request itself is at fault; another channel cannot do
/// better and the failure is not held against the channel.
pub(crate) fn should_retry(status: StatusCode) -> bool {
    status != StatusCode::BAD_REQUEST && status != StatusCode::PAYLOAD_TOO_LARGE
}

/// 401/402/403/404 mean the channel cannot serve this model right now; the
/// retry loop ignores it for the rest of the request.
pub(crate) fn channel_has_permission(status: StatusCode) -> bool {
    !matches!(
        status,
        StatusCode::UNAUTHORIZED
            | StatusCode::PAYMENT_REQUIRED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_FOUND
    )
}

pub(crate) fn should_delay(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
}

fn client_closed_request() -> RelayError {
    // 499 per the nginx convention; the client is gone either way.
    let status = StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT);
    RelayError::from_message(status, "aigate_error", "request_cancelled", "request cancelled")
}

/// Run one attempt against the bound channel and classify the outcome.
///
/// Returns the handler result and whether the failure is worth another
/// channel. Every non-client-fault outcome is reported to the monitor;
/// monitor errors are logged and swallowed.
pub(crate) async fn relay_attempt(
    handler: &dyn RelayHandler,
    monitor: &dyn Monitor,
    notifier: &Notifier,
    meta: &RequestMeta,
    body: Bytes,
    cancel: &CancellationToken,
) -> (HandleResult, bool) {
    let result = tokio::select! {
        result = handler.handle(meta, body) => result,
        _ = cancel.cancelled() => return (HandleResult::failure(client_closed_request()), false),
    };

    let Some(error) = result.error.as_ref() else {
        if let Err(err) = monitor
            .add_request(&meta.origin_model, meta.channel.id, false, false)
            .await
        {
            error!(event = "monitor_add_request_failed", error = %err);
        }
        return (result, false);
    };

    let status = error.status;
    if !should_retry(status) {
        return (result, false);
    }

    let has_permission = channel_has_permission(status);
    let feedback = match monitor
        .add_request(&meta.origin_model, meta.channel.id, true, !has_permission)
        .await
    {
        Ok(feedback) => feedback,
        Err(err) => {
            error!(event = "monitor_add_request_failed", error = %err);
            RequestFeedback::default()
        }
    };

    let payload = error.json_or_empty();
    let channel = &meta.channel;
    if feedback.ban_executed {
        notifier.error_throttle(
            &format!("auto_banned:{}:{}", channel.id, meta.origin_model),
            NOTIFY_INTERVAL,
            &format!(
                "channel[{}] {}({}) model {} is auto banned",
                channel.channel_type, channel.name, channel.id, meta.origin_model
            ),
            &payload,
        );
    } else if feedback.beyond_threshold {
        notifier.warn_throttle(
            &format!("beyond_threshold:{}:{}", channel.id, meta.origin_model),
            NOTIFY_INTERVAL,
            &format!(
                "channel[{}] {}({}) model {} error rate is beyond threshold",
                channel.channel_type, channel.name, channel.id, meta.origin_model
            ),
            &payload,
        );
    } else if !has_permission {
        notifier.error_throttle(
            &format!("channel_no_permission:{}:{}", channel.id, meta.origin_model),
            NOTIFY_INTERVAL,
            &format!(
                "channel[{}] {}({}) model {} has no permission",
                channel.channel_type, channel.name, channel.id, meta.origin_model
            ),
            &payload,
        );
    }

    (result, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_faults_are_not_retriable() {
        assert!(!should_retry(StatusCode::BAD_REQUEST));
        assert!(!should_retry(StatusCode::PAYLOAD_TOO_LARGE));
        assert!(should_retry(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry(StatusCode::FORBIDDEN));
    }

    #[test]
    fn no_permission_statuses() {
        for status in [401u16, 402, 403, 404] {
            let status = StatusCode::from_u16(status).unwrap();
            assert!(!channel_has_permission(status));
        }
        assert!(channel_has_permission(StatusCode::TOO_MANY_REQUESTS));
        assert!(channel_has_permission(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn only_rate_limits_delay() {
        assert!(should_delay(StatusCode::TOO_MANY_REQUESTS));
        assert!(!should_delay(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
