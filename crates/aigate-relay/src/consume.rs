use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use aigate_model::{BalanceConsumer, Mode, PRICE_UNIT, Price, Usage};

use crate::handler::RequestDetail;

/// One attempt's authoritative consumption record.
#[derive(Clone)]
pub struct ConsumeEvent {
    pub request_id: String,
    pub group: String,
    pub consumer: Arc<dyn BalanceConsumer>,
    pub status: u16,
    pub mode: Mode,
    pub channel_id: i64,
    pub origin_model: String,
    pub actual_model: String,
    pub usage: Usage,
    pub price: Price,
    /// Upstream error JSON, empty on success.
    pub error_payload: String,
    pub client_ip: String,
    /// 0 for the first attempt, then the retry number.
    pub attempt_index: u32,
    pub detail: Option<RequestDetail>,
    /// Whether this attempt's response was the one surfaced to the client.
    pub downstream_result: bool,
    pub recorded_at: OffsetDateTime,
}

impl std::fmt::Debug for ConsumeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumeEvent")
            .field("request_id", &self.request_id)
            .field("group", &self.group)
            .field("status", &self.status)
            .field("channel_id", &self.channel_id)
            .field("attempt_index", &self.attempt_index)
            .field("downstream_result", &self.downstream_result)
            .finish()
    }
}

/// Accepts consumption records without blocking the request path.
pub trait ConsumeSink: Send + Sync {
    fn enqueue(&self, event: ConsumeEvent);
}

/// Token usage priced in decimal; the amount stays `Decimal` all the way
/// into the balance debit.
pub fn calculate_amount(usage: &Usage, price: &Price) -> Decimal {
    let unit = Decimal::from(PRICE_UNIT);
    let input = Decimal::from(usage.input_tokens) * price.input_price / unit;
    let output = Decimal::from(usage.output_tokens) * price.output_price / unit;
    input + output + price.per_request_price
}

/// Asynchronous consumption recorder.
///
/// Producers enqueue; a single worker debits the group balance and writes
/// the usage log line. Dropping every sender (shutdown) lets the worker
/// drain the queue and exit.
pub struct AsyncConsumer {
    tx: mpsc::UnboundedSender<ConsumeEvent>,
    handle: JoinHandle<()>,
}

impl AsyncConsumer {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(consume_worker(rx));
        Self { tx, handle }
    }

    pub fn sink(&self) -> ConsumerSink {
        ConsumerSink {
            tx: self.tx.clone(),
        }
    }

    /// Drain outstanding records and stop the worker.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(err) = self.handle.await {
            error!(event = "consume_worker_join_failed", error = %err);
        }
    }
}

/// Cloneable producer handle onto the consumer queue.
#[derive(Clone)]
pub struct ConsumerSink {
    tx: mpsc::UnboundedSender<ConsumeEvent>,
}

impl ConsumeSink for ConsumerSink {
    fn enqueue(&self, event: ConsumeEvent) {
        if self.tx.send(event).is_err() {
            warn!(event = "consume_queue_closed");
        }
    }
}

async fn consume_worker(mut rx: mpsc::UnboundedReceiver<ConsumeEvent>) {
    while let Some(event) = rx.recv().await {
        let amount = calculate_amount(&event.usage, &event.price);
        if amount > Decimal::ZERO
            && let Err(err) = event.consumer.consume(amount)
        {
            error!(
                event = "consume_failed",
                request_id = %event.request_id,
                group = %event.group,
                amount = %amount,
                error = %err,
            );
        }

        info!(
            event = "consumed",
            request_id = %event.request_id,
            group = %event.group,
            mode = %event.mode,
            channel_id = event.channel_id,
            model = %event.origin_model,
            status = event.status,
            attempt = event.attempt_index,
            downstream_result = event.downstream_result,
            input_tokens = event.usage.input_tokens,
            output_tokens = event.usage.output_tokens,
            amount = %amount,
        );
    }
}
