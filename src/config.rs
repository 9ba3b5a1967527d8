use std::time::Duration;

use serde::Deserialize;

/// Default global device provisioning endpoint
pub const DEFAULT_PROVISIONING_HOST: &str = "global.azure-devices-provisioning.net";
/// Service API version sent on every request
pub const DEFAULT_API_VERSION: &str = "2019-03-31";

const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(2000);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Settings shared by the transports and the registration state machine
///
/// Every field has a default, so a partial configuration can be deserialized:
///
/// ```
/// use azure_iot_provisioning::ProvisioningConfig;
///
/// let config: ProvisioningConfig =
///     serde_json::from_str(r#"{ "polling_interval_ms": 500 }"#).unwrap();
/// assert_eq!(config.polling_interval.as_millis(), 500);
/// assert_eq!(config.api_version, "2019-03-31");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Host name of the provisioning service
    pub provisioning_host: String,
    /// `api-version` query parameter
    pub api_version: String,
    /// Delay between status queries when the service gives no `retry-after`
    #[serde(rename = "polling_interval_ms", with = "duration_ms")]
    pub polling_interval: Duration,
    /// Upper bound for each individual network call
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// MQTT keep alive interval
    #[serde(rename = "keep_alive_ms", with = "duration_ms")]
    pub keep_alive: Duration,
    /// Client agent reported to the service
    pub user_agent: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            provisioning_host: DEFAULT_PROVISIONING_HOST.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            polling_interval: DEFAULT_POLLING_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            user_agent: format!("azure-iot-provisioning-rs/{}", crate::SDK_VERSION),
        }
    }
}

impl ProvisioningConfig {
    /// Override the delay used between status queries
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Override the per call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the provisioning host
    pub fn with_provisioning_host(mut self, host: impl Into<String>) -> Self {
        self.provisioning_host = host.into();
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ProvisioningConfig::default();
        assert_eq!(config.provisioning_host, DEFAULT_PROVISIONING_HOST);
        assert_eq!(config.polling_interval, Duration::from_millis(2000));
        assert!(config.user_agent.starts_with("azure-iot-provisioning-rs/"));
    }

    #[test]
    fn deserializes_overrides() {
        let config: ProvisioningConfig = serde_json::from_str(
            r#"{ "provisioning_host": "dps.example.net", "timeout_ms": 1500 }"#,
        )
        .unwrap();
        assert_eq!(config.provisioning_host, "dps.example.net");
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.keep_alive, DEFAULT_KEEP_ALIVE);
    }
}
