//! Data model shared by the aigate dispatch core.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP
//! client. It holds the channel/group/pricing types the relay engine reads
//! through immutable snapshots; higher layers own IO and mutation.

pub mod cache;
pub mod channel;
pub mod group;
pub mod mode;
pub mod price;
pub mod usage;

pub use cache::ModelCaches;
pub use channel::{Channel, ChannelStatus, DEFAULT_PRIORITY};
pub use group::{BalanceConsumer, BalanceError, Group, MemoryBalance};
pub use mode::Mode;
pub use price::{PRICE_UNIT, ModelConfig, Price};
pub use usage::Usage;
