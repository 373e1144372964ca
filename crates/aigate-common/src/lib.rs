use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > seed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Admin key guarding the maintenance surface (channel tests).
    pub admin_key: String,
    /// Max retry attempts after the first. `0` disables retries.
    pub retry_times: u32,
    /// Gate for the admission check and consumption amounts.
    pub billing_enabled: bool,
    /// Retain request/response detail on successful attempts.
    pub save_all_log_detail: bool,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key: Option<String>,
    pub retry_times: Option<u32>,
    pub billing_enabled: Option<bool>,
    pub save_all_log_detail: Option<bool>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key.is_some() {
            self.admin_key = other.admin_key;
        }
        if other.retry_times.is_some() {
            self.retry_times = other.retry_times;
        }
        if other.billing_enabled.is_some() {
            self.billing_enabled = other.billing_enabled;
        }
        if other.save_all_log_detail.is_some() {
            self.save_all_log_detail = other.save_all_log_detail;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8970),
            admin_key: self
                .admin_key
                .ok_or(GlobalConfigError::MissingField("admin_key"))?,
            retry_times: self.retry_times.unwrap_or(3),
            billing_enabled: self.billing_enabled.unwrap_or(true),
            save_all_log_detail: self.save_all_log_detail.unwrap_or(false),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key: Some(value.admin_key),
            retry_times: Some(value.retry_times),
            billing_enabled: Some(value.billing_enabled),
            save_all_log_detail: Some(value.save_all_log_detail),
        }
    }
}
