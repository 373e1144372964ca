use clap::Parser;

use aigate_common::GlobalConfigPatch;

#[derive(Parser)]
#[command(name = "aigate")]
pub(crate) struct Cli {
    #[arg(long)]
    pub(crate) host: Option<String>,
    #[arg(long)]
    pub(crate) port: Option<u16>,
    #[arg(long)]
    pub(crate) admin_key: Option<String>,
    #[arg(long)]
    pub(crate) retry_times: Option<u32>,
    #[arg(long)]
    pub(crate) billing_enabled: Option<bool>,
    #[arg(long)]
    pub(crate) save_all_log_detail: Option<bool>,
    /// Channels, model prices, and groups loaded at boot.
    #[arg(long, default_value = "aigate.json")]
    pub(crate) seed: String,
}

impl Cli {
    pub(crate) fn as_patch(&self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host.clone(),
            port: self.port,
            admin_key: self.admin_key.clone(),
            retry_times: self.retry_times,
            billing_enabled: self.billing_enabled,
            save_all_log_detail: self.save_all_log_detail,
        }
    }
}

pub(crate) fn env_patch() -> GlobalConfigPatch {
    GlobalConfigPatch {
        host: std::env::var("AIGATE_HOST").ok(),
        port: std::env::var("AIGATE_PORT").ok().and_then(|v| v.parse().ok()),
        admin_key: std::env::var("AIGATE_ADMIN_KEY").ok(),
        retry_times: std::env::var("AIGATE_RETRY_TIMES")
            .ok()
            .and_then(|v| v.parse().ok()),
        billing_enabled: std::env::var("AIGATE_BILLING_ENABLED")
            .ok()
            .and_then(|v| v.parse().ok()),
        save_all_log_detail: std::env::var("AIGATE_SAVE_ALL_LOG_DETAIL")
            .ok()
            .and_then(|v| v.parse().ok()),
    }
}
