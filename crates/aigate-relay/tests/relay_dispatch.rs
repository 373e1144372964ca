use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use aigate_common::GlobalConfig;
use aigate_model::{
    Channel, ChannelStatus, Group, MemoryBalance, Mode, ModelCaches, ModelConfig, Price, Usage,
};
use aigate_monitor::{Monitor, MonitorError, RequestFeedback};
use aigate_relay::{
    AppState, ConsumeEvent, ConsumeSink, HandleResult, RelayEngine, RelayError, RelayHandler,
    RelayRequest, RequestMeta, UpstreamResponse,
};

struct ScriptedHandler {
    responses: Mutex<VecDeque<HandleResult>>,
    calls: Mutex<Vec<(i64, Bytes)>>,
}

impl ScriptedHandler {
    fn new(responses: Vec<HandleResult>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(i64, Bytes)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayHandler for ScriptedHandler {
    async fn handle(&self, meta: &RequestMeta, body: Bytes) -> HandleResult {
        self.calls.lock().unwrap().push((meta.channel.id, body));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(success)
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ConsumeEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<ConsumeEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ConsumeSink for RecordingSink {
    fn enqueue(&self, event: ConsumeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct RecordingMonitor {
    banned: Vec<i64>,
    records: Mutex<Vec<(String, i64, bool, bool)>>,
}

impl RecordingMonitor {
    fn with_banned(banned: Vec<i64>) -> Self {
        Self {
            banned,
            ..Default::default()
        }
    }

    fn records(&self) -> Vec<(String, i64, bool, bool)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl Monitor for RecordingMonitor {
    async fn banned_channels(&self, _model: &str) -> Result<Vec<i64>, MonitorError> {
        Ok(self.banned.clone())
    }

    async fn error_rates(&self, _model: &str) -> Result<HashMap<i64, f64>, MonitorError> {
        Ok(HashMap::new())
    }

    async fn add_request(
        &self,
        model: &str,
        channel_id: i64,
        failed: bool,
        no_permission: bool,
    ) -> Result<RequestFeedback, MonitorError> {
        self.records
            .lock()
            .unwrap()
            .push((model.to_string(), channel_id, failed, no_permission));
        Ok(RequestFeedback::default())
    }
}

fn success() -> HandleResult {
    HandleResult {
        response: Some(UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"choices":[]}"#),
        }),
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            cached_tokens: 0,
        },
        detail: None,
        error: None,
    }
}

fn failure(status: u16) -> HandleResult {
    HandleResult::failure(RelayError::from_message(
        StatusCode::from_u16(status).unwrap(),
        "upstream_error",
        "boom",
        "upstream exploded",
    ))
}

fn channel(id: i64) -> Arc<Channel> {
    Arc::new(Channel {
        id,
        channel_type: 1,
        name: format!("ch-{id}"),
        status: ChannelStatus::Enabled,
        priority: Some(10),
        config: serde_json::Value::Null,
    })
}

struct Fixture {
    engine: RelayEngine,
    sink: Arc<RecordingSink>,
    monitor: Arc<RecordingMonitor>,
    handler: Arc<ScriptedHandler>,
}

fn fixture(
    channels: Vec<Arc<Channel>>,
    responses: Vec<HandleResult>,
    retry_times: u32,
    billing_enabled: bool,
    monitor: RecordingMonitor,
) -> Fixture {
    let state = Arc::new(AppState::new(GlobalConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        admin_key: "test".to_string(),
        retry_times,
        billing_enabled,
        save_all_log_detail: false,
    }));

    let mut caches = ModelCaches::new();
    caches.insert_set(
        "default",
        channels
            .iter()
            .map(|channel| ("test-model".to_string(), channel.clone())),
    );
    let by_id = channels
        .iter()
        .map(|channel| (channel.id, channel.clone()))
        .collect();
    state.apply_caches(caches, by_id);

    let sink = Arc::new(RecordingSink::default());
    let monitor = Arc::new(monitor);
    let handler = ScriptedHandler::new(responses);
    let engine = RelayEngine::new(
        state,
        monitor.clone(),
        sink.clone(),
        handler.clone(),
    );
    Fixture {
        engine,
        sink,
        monitor,
        handler,
    }
}

fn request(balance: Decimal, designated: Option<Arc<Channel>>) -> RelayRequest {
    RelayRequest {
        request_id: "req-test".to_string(),
        mode: Mode::ChatCompletions,
        origin_model: "test-model".to_string(),
        model_config: ModelConfig {
            model: "test-model".to_string(),
            price: Price {
                input_price: dec!(1.0),
                output_price: dec!(2.0),
                per_request_price: Decimal::ZERO,
            },
            actual_model: None,
        },
        group: Arc::new(Group::new(
            "acme",
            vec!["default".to_string()],
            Arc::new(MemoryBalance::new(balance)),
        )),
        designated_channel: designated,
        body: Bytes::from_static(br#"{"model":"test-model","messages":[{"role":"user","content":"hello there"}]}"#),
        client_ip: "127.0.0.1".to_string(),
        cancel: CancellationToken::new(),
    }
}

fn attempt_summary(events: &[ConsumeEvent]) -> Vec<(u32, bool, u16)> {
    events
        .iter()
        .map(|event| (event.attempt_index, event.downstream_result, event.status))
        .collect()
}

#[tokio::test]
async fn single_healthy_channel_records_one_attempt() {
    let f = fixture(
        vec![channel(1)],
        vec![success()],
        3,
        false,
        RecordingMonitor::default(),
    );

    let response = f.engine.relay(request(Decimal::ZERO, None)).await;
    assert_eq!(response.status, StatusCode::OK);

    assert_eq!(attempt_summary(&f.sink.events()), vec![(0, true, 200)]);
    assert_eq!(
        f.monitor.records(),
        vec![("test-model".to_string(), 1, false, false)]
    );
}

#[tokio::test]
async fn retriable_failure_then_success_records_both_attempts() {
    let f = fixture(
        vec![channel(1), channel(2)],
        vec![failure(500), success()],
        2,
        false,
        RecordingMonitor::default(),
    );

    let response = f.engine.relay(request(Decimal::ZERO, None)).await;
    assert_eq!(response.status, StatusCode::OK);

    let events = f.sink.events();
    assert_eq!(attempt_summary(&events), vec![(0, false, 500), (1, true, 200)]);

    // 500 keeps permission: the failing channel is never ignored, and the
    // failure is reported against it.
    let records = f.monitor.records();
    assert_eq!(records.len(), 2);
    assert!(records[0].2 && !records[0].3);
    assert!(!records[1].2);
}

#[tokio::test]
async fn request_body_is_restored_byte_identical_across_attempts() {
    let f = fixture(
        vec![channel(1), channel(2), channel(3)],
        vec![failure(500), failure(502), success()],
        3,
        false,
        RecordingMonitor::default(),
    );

    let req = request(Decimal::ZERO, None);
    let original = req.body.clone();
    f.engine.relay(req).await;

    let calls = f.handler.calls();
    assert_eq!(calls.len(), 3);
    for (_, body) in calls {
        assert_eq!(body, original);
    }
}

#[tokio::test]
async fn no_permission_failure_is_ignored_and_does_not_burn_the_budget() {
    let f = fixture(
        vec![channel(1), channel(2)],
        vec![failure(403), success()],
        1,
        false,
        RecordingMonitor::default(),
    );

    let response = f.engine.relay(request(Decimal::ZERO, None)).await;
    assert_eq!(response.status, StatusCode::OK);

    let events = f.sink.events();
    assert_eq!(attempt_summary(&events), vec![(0, false, 403), (1, true, 200)]);

    // The 403 channel was reported as a no-permission failure.
    let first = &f.monitor.records()[0];
    assert!(first.2 && first.3);
    // The retry went to the other channel.
    let calls = f.handler.calls();
    assert_ne!(calls[0].0, calls[1].0);
}

#[tokio::test]
async fn all_no_permission_terminates_after_every_channel_is_ignored() {
    let f = fixture(
        vec![channel(1), channel(2)],
        vec![failure(403), failure(404)],
        1,
        false,
        RecordingMonitor::default(),
    );

    let response = f.engine.relay(request(Decimal::ZERO, None)).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    // The no-permission retry was forgiven, so both channels were tried even
    // with a budget of one; indices stay dense with one downstream result.
    let events = f.sink.events();
    assert_eq!(attempt_summary(&events), vec![(0, false, 403), (1, true, 404)]);
    let calls = f.handler.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].0, calls[1].0);
}

#[tokio::test]
async fn non_retriable_status_skips_retry_and_monitor() {
    let f = fixture(
        vec![channel(1), channel(2)],
        vec![failure(400)],
        3,
        false,
        RecordingMonitor::default(),
    );

    let response = f.engine.relay(request(Decimal::ZERO, None)).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    assert_eq!(attempt_summary(&f.sink.events()), vec![(0, true, 400)]);
    assert!(f.monitor.records().is_empty());
    assert_eq!(f.handler.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn banned_pool_of_rate_limited_channels_reuses_the_last_permission_channel() {
    // Both channels enter banned; the entry fallback still draws one, and
    // once the retry selector exhausts the banned ignore list the loop
    // falls back to the channel that answered 429.
    let f = fixture(
        vec![channel(1), channel(2)],
        vec![failure(429), failure(429)],
        1,
        false,
        RecordingMonitor::with_banned(vec![1, 2]),
    );

    let response = f.engine.relay(request(Decimal::ZERO, None)).await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);

    let events = f.sink.events();
    assert_eq!(attempt_summary(&events), vec![(0, false, 429), (1, true, 429)]);

    // The fallback reused the same channel rather than drawing a new one.
    let calls = f.handler.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, calls[1].0);
}

#[tokio::test]
async fn insufficient_balance_rejects_before_any_attempt() {
    let f = fixture(
        vec![channel(1)],
        vec![success()],
        3,
        true,
        RecordingMonitor::default(),
    );

    // ~2 estimated input tokens at 1.0/M is far below 0.5, but force a
    // shortfall with a tiny balance and a large request price instead.
    let mut req = request(Decimal::ZERO, None);
    req.model_config.price.input_price = dec!(1_000_000_000);
    let response = f.engine.relay(req).await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    let body = String::from_utf8_lossy(&response.body).into_owned();
    assert!(body.contains("group_balance_not_enough"), "body: {body}");
    assert!(body.contains("request id: req-test"), "body: {body}");

    assert!(f.sink.events().is_empty());
    assert!(f.handler.calls().is_empty());
    assert!(f.monitor.records().is_empty());
}

#[tokio::test]
async fn designated_channel_disables_alternate_selection() {
    let pinned = channel(7);
    let f = fixture(
        vec![channel(1), channel(2)],
        vec![failure(500), failure(500)],
        1,
        false,
        RecordingMonitor::default(),
    );

    let response = f.engine.relay(request(Decimal::ZERO, Some(pinned))).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);

    // Both attempts hit the pinned channel; the pool was never consulted.
    let calls = f.handler.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, 7);
    assert_eq!(calls[1].0, 7);

    assert_eq!(
        attempt_summary(&f.sink.events()),
        vec![(0, false, 500), (1, true, 500)]
    );
}

#[tokio::test]
async fn empty_candidate_pool_surfaces_saturation() {
    let f = fixture(
        Vec::new(),
        Vec::new(),
        3,
        false,
        RecordingMonitor::default(),
    );

    let response = f.engine.relay(request(Decimal::ZERO, None)).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    let body = String::from_utf8_lossy(&response.body).into_owned();
    assert!(body.contains("the upstream load is saturated"), "body: {body}");
    assert!(f.sink.events().is_empty());
}

#[tokio::test]
async fn retries_disabled_surfaces_the_first_failure() {
    let f = fixture(
        vec![channel(1), channel(2)],
        vec![failure(500)],
        0,
        false,
        RecordingMonitor::default(),
    );

    let response = f.engine.relay(request(Decimal::ZERO, None)).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    let body = String::from_utf8_lossy(&response.body).into_owned();
    assert!(body.contains("request id: req-test"), "body: {body}");

    assert_eq!(attempt_summary(&f.sink.events()), vec![(0, true, 500)]);
    assert_eq!(f.handler.calls().len(), 1);
}

#[tokio::test]
async fn cancelled_request_records_what_it_has_and_stops() {
    let f = fixture(
        vec![channel(1), channel(2)],
        vec![failure(500)],
        3,
        false,
        RecordingMonitor::default(),
    );

    let mut req = request(Decimal::ZERO, None);
    req.cancel = CancellationToken::new();
    req.cancel.cancel();
    f.engine.relay(req).await;

    let events = f.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].attempt_index, 0);
    assert!(events[0].downstream_result);
    // No retry ran after cancellation.
    assert!(f.handler.calls().len() <= 1);
}
