use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use aigate_model::{Channel, Group, Mode, ModelConfig, Price};
use aigate_monitor::Monitor;

use crate::admission::{ModeBilling, pre_consumed_amount};
use crate::consume::{ConsumeEvent, ConsumeSink};
use crate::handler::{HandleResult, RelayError, RelayHandler, UpstreamResponse};
use crate::meta::RequestMeta;
use crate::notify::Notifier;
use crate::retry::{InitialChannel, init_retry_state, retry_loop};
use crate::select::get_channel_with_fallback;
use crate::state::AppState;
use crate::{attempt, select::SelectError};

pub(crate) const ERROR_TYPE_AIGATE: &str = "aigate_error";

/// Machine-readable code for the admission balance rejection.
pub const GROUP_BALANCE_NOT_ENOUGH: &str = "group_balance_not_enough";

pub(crate) fn saturated_error() -> RelayError {
    RelayError::from_message(
        StatusCode::SERVICE_UNAVAILABLE,
        ERROR_TYPE_AIGATE,
        "upstream_saturated",
        "the upstream load is saturated, please try again later",
    )
}

/// Everything the router resolves before handing a request to the core.
pub struct RelayRequest {
    pub request_id: String,
    pub mode: Mode,
    pub origin_model: String,
    pub model_config: ModelConfig,
    pub group: Arc<Group>,
    /// Caller-pinned channel; disables alternate selection.
    pub designated_channel: Option<Arc<Channel>>,
    /// Request body captured once at ingress; cloned per attempt.
    pub body: Bytes,
    pub client_ip: String,
    pub cancel: CancellationToken,
}

/// The dispatch core. One instance serves all requests; per-request state
/// lives in `RelayRequest` and the retry loop.
pub struct RelayEngine {
    state: Arc<AppState>,
    monitor: Arc<dyn Monitor>,
    consume: Arc<dyn ConsumeSink>,
    notifier: Notifier,
    handler: Arc<dyn RelayHandler>,
}

impl RelayEngine {
    pub fn new(
        state: Arc<AppState>,
        monitor: Arc<dyn Monitor>,
        consume: Arc<dyn ConsumeSink>,
        handler: Arc<dyn RelayHandler>,
    ) -> Self {
        Self {
            state,
            monitor,
            consume,
            notifier: Notifier::new(),
            handler,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub(crate) fn handler(&self) -> &dyn RelayHandler {
        self.handler.as_ref()
    }

    /// Dispatch one request: select, admit, execute, retry, record.
    pub async fn relay(&self, req: RelayRequest) -> UpstreamResponse {
        let initial = match self.initial_channel(&req).await {
            Ok(initial) => initial,
            Err(err) => {
                debug!(event = "no_initial_channel", request_id = %req.request_id, error = %err);
                return self.finish(&req, HandleResult::failure(saturated_error()));
            }
        };

        let global = self.state.global.load_full();
        let billing = ModeBilling::for_mode(req.mode);

        let mut price = Price::default();
        if global.billing_enabled
            && let Some(price_fn) = billing.price
        {
            price = match price_fn(&req.model_config) {
                Ok(price) => price,
                Err(err) => {
                    return self.finish(
                        &req,
                        HandleResult::failure(RelayError::from_message(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            ERROR_TYPE_AIGATE,
                            "request_price_failed",
                            format!("get request price failed: {err}"),
                        )),
                    );
                }
            };
        }

        let mut input_tokens = 0;
        if global.billing_enabled
            && let Some(usage_fn) = billing.usage
        {
            let request_usage = match usage_fn(&req.body, &req.model_config) {
                Ok(usage) => usage,
                Err(err) => {
                    return self.finish(
                        &req,
                        HandleResult::failure(RelayError::from_message(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            ERROR_TYPE_AIGATE,
                            "request_usage_failed",
                            format!("get request usage failed: {err}"),
                        )),
                    );
                }
            };

            let pre_consumed = pre_consumed_amount(&request_usage, &price);
            if !req.group.consumer.check_balance(pre_consumed) {
                return self.finish(
                    &req,
                    HandleResult::failure(RelayError::from_message(
                        StatusCode::FORBIDDEN,
                        ERROR_TYPE_AIGATE,
                        GROUP_BALANCE_NOT_ENOUGH,
                        format!("group ({}) balance not enough", req.group.name),
                    )),
                );
            }
            input_tokens = request_usage.input_tokens;
        }

        let meta = self.build_meta(&req, initial.channel.clone(), input_tokens);

        // First attempt.
        let (result, retry) = self.attempt(&meta, req.body.clone(), &req.cancel).await;

        let retry_times = global.retry_times;
        if result.error.is_none() || !retry || retry_times == 0 || req.cancel.is_cancelled() {
            self.record_result(&req, &meta, &price, &result, 0, true);
            return self.finish(&req, result);
        }

        let state = init_retry_state(retry_times, &initial, meta, result, price);
        let final_result = retry_loop(self, &req, state).await;
        self.finish(&req, final_result)
    }

    async fn initial_channel(&self, req: &RelayRequest) -> Result<InitialChannel, SelectError> {
        if let Some(channel) = req.designated_channel.clone() {
            debug!(event = "designated_channel", request_id = %req.request_id, channel_id = channel.id);
            return Ok(InitialChannel {
                channel,
                designated: true,
                ignore_channel_ids: Vec::new(),
                error_rates: HashMap::new(),
                migrated_channels: Vec::new(),
            });
        }

        let banned = match self.monitor.banned_channels(&req.origin_model).await {
            Ok(banned) => banned,
            Err(err) => {
                error!(event = "banned_channels_failed", model = %req.origin_model, error = %err);
                Vec::new()
            }
        };
        let error_rates = match self.monitor.error_rates(&req.origin_model).await {
            Ok(rates) => rates,
            Err(err) => {
                error!(event = "error_rates_failed", model = %req.origin_model, error = %err);
                HashMap::new()
            }
        };

        let caches = self.state.caches.load();
        let (channel, migrated_channels) = get_channel_with_fallback(
            &caches,
            &req.group.available_sets,
            &req.origin_model,
            &error_rates,
            &banned,
        )?;

        Ok(InitialChannel {
            channel,
            designated: false,
            ignore_channel_ids: banned,
            error_rates,
            migrated_channels,
        })
    }

    pub(crate) fn build_meta(
        &self,
        req: &RelayRequest,
        channel: Arc<Channel>,
        input_tokens: i64,
    ) -> RequestMeta {
        RequestMeta::new(
            req.request_id.clone(),
            req.group.name.clone(),
            req.mode,
            channel,
            req.origin_model.clone(),
            req.model_config.actual_model().to_string(),
            input_tokens,
            req.client_ip.clone(),
        )
    }

    pub(crate) async fn attempt(
        &self,
        meta: &RequestMeta,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> (HandleResult, bool) {
        attempt::relay_attempt(
            self.handler.as_ref(),
            self.monitor.as_ref(),
            &self.notifier,
            meta,
            body,
            cancel,
        )
        .await
    }

    /// Flush one attempt's consumption to the async recorder.
    pub(crate) fn record_result(
        &self,
        req: &RelayRequest,
        meta: &RequestMeta,
        price: &Price,
        result: &HandleResult,
        attempt_index: u32,
        downstream_result: bool,
    ) {
        let (status, error_payload) = match result.error.as_ref() {
            Some(error) => (error.status.as_u16(), error.json_or_empty()),
            None => (StatusCode::OK.as_u16(), String::new()),
        };

        let save_all = self.state.global.load().save_all_log_detail;
        let detail = if status == StatusCode::OK.as_u16() && !save_all {
            None
        } else {
            result.detail.clone()
        };

        self.consume.enqueue(ConsumeEvent {
            request_id: meta.request_id.clone(),
            group: meta.group.clone(),
            consumer: req.group.consumer.clone(),
            status,
            mode: meta.mode,
            channel_id: meta.channel.id,
            origin_model: meta.origin_model.clone(),
            actual_model: meta.actual_model.clone(),
            usage: result.usage,
            price: *price,
            error_payload,
            client_ip: meta.client_ip.clone(),
            attempt_index,
            detail,
            downstream_result,
            recorded_at: OffsetDateTime::now_utc(),
        });
    }

    /// Turn the final result into the client response, decorating errors
    /// with the correlation id.
    fn finish(&self, req: &RelayRequest, mut result: HandleResult) -> UpstreamResponse {
        if let Some(mut error) = result.error.take() {
            error.decorate_request_id(&req.request_id);
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            return UpstreamResponse {
                status: error.status,
                headers,
                body: Bytes::from(error.payload.to_string()),
            };
        }

        match result.response {
            Some(response) => response,
            None => {
                // A successful handler must surface a body.
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                let mut error = RelayError::from_message(
                    StatusCode::BAD_GATEWAY,
                    ERROR_TYPE_AIGATE,
                    "empty_upstream_response",
                    "upstream returned no body",
                );
                error.decorate_request_id(&req.request_id);
                UpstreamResponse {
                    status: error.status,
                    headers,
                    body: Bytes::from(error.payload.to_string()),
                }
            }
        }
    }
}
