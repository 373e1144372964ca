//! HTTP surface for the aigate dispatch core.

mod admin;
mod relay;

pub use admin::admin_router;
pub use relay::relay_router;
