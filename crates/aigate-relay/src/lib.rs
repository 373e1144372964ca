//! The aigate request-dispatch core.
//!
//! Given a (group, model, mode) triple this crate selects an upstream
//! channel by error-rate-weighted random draw, admits the request against
//! the group balance, executes the mode handler, retries across alternative
//! channels on retriable failures, feeds every outcome to the health
//! monitor, and records per-attempt consumption through an async queue.

pub mod admission;
pub mod consume;
pub mod engine;
pub mod handler;
pub mod meta;
pub mod notify;
pub mod select;
pub mod state;
pub mod upstream;

mod attempt;
mod retry;

pub use admission::{AdmissionError, ModeBilling, pre_consumed_amount};
pub use channel_test::ChannelTestResult;
pub use consume::{AsyncConsumer, ConsumeEvent, ConsumeSink, calculate_amount};
pub use engine::{RelayEngine, RelayRequest};
pub use handler::{HandleResult, RelayError, RelayHandler, RequestDetail, UpstreamResponse};
pub use meta::RequestMeta;
pub use notify::Notifier;
pub use select::{SelectError, candidate_channels, get_channel_with_fallback, get_random_channel};
pub use state::AppState;
pub use upstream::PassthroughHandler;
