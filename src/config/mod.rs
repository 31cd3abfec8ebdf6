use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bluer::Uuid;
use serde::{Deserialize, Serialize};

use crate::bluetooth::GattUuids;
use crate::device::Timing;

/// Application configuration stored as TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Selected device Bluetooth address.
    pub device_address: Option<String>,
    /// Selected device name.
    pub device_name: Option<String>,
    /// Override for the QXW service UUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_uuid: Option<String>,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Protocol delays in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub command_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub unsubscribe_grace_ms: u64,
    pub drop_grace_ms: u64,
    pub disconnect_grace_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::from(Timing::default())
    }
}

impl From<Timing> for TimingConfig {
    fn from(t: Timing) -> Self {
        let ms = |d: Duration| d.as_millis() as u64;
        Self {
            command_timeout_ms: ms(t.command_timeout),
            settle_delay_ms: ms(t.settle_delay),
            unsubscribe_grace_ms: ms(t.unsubscribe_grace),
            drop_grace_ms: ms(t.drop_grace),
            disconnect_grace_ms: ms(t.disconnect_grace),
            connect_timeout_ms: ms(t.connect_timeout),
        }
    }
}

impl From<TimingConfig> for Timing {
    fn from(c: TimingConfig) -> Self {
        Self {
            command_timeout: Duration::from_millis(c.command_timeout_ms),
            settle_delay: Duration::from_millis(c.settle_delay_ms),
            unsubscribe_grace: Duration::from_millis(c.unsubscribe_grace_ms),
            drop_grace: Duration::from_millis(c.drop_grace_ms),
            disconnect_grace: Duration::from_millis(c.disconnect_grace_ms),
            connect_timeout: Duration::from_millis(c.connect_timeout_ms),
        }
    }
}

impl AppConfig {
    /// Config file path: ~/.config/fairbuds/config.toml
    pub fn path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fairbuds");
        config_dir.join("config.toml")
    }

    /// Load config from disk, or return defaults.
    pub fn load() -> Self {
        let path = Self::path();
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!("Failed to parse config: {:#}", e),
                },
                Err(e) => tracing::warn!("Failed to read config: {}", e),
            }
        }
        Self::default()
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("invalid config TOML")
    }

    /// Save config to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn timing(&self) -> Timing {
        self.timing.into()
    }

    /// GATT UUIDs with overrides applied. Unparseable overrides fall back to the default.
    pub fn uuids(&self) -> GattUuids {
        let defaults = GattUuids::default();
        GattUuids {
            service: uuid_or("service_uuid", &self.service_uuid, defaults.service),
            write: uuid_or("write_uuid", &self.write_uuid, defaults.write),
            notify: uuid_or("notify_uuid", &self.notify_uuid, defaults.notify),
        }
    }
}

fn uuid_or(key: &str, value: &Option<String>, default: Uuid) -> Uuid {
    match value.as_deref().map(Uuid::parse_str) {
        Some(Ok(uuid)) => uuid,
        Some(Err(e)) => {
            tracing::warn!("Ignoring {}: {}", key, e);
            default
        }
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::{NOTIFY_UUID, SERVICE_UUID, WRITE_UUID};

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.timing(), Timing::default());
        assert_eq!(config.timing.command_timeout_ms, 5000);
        assert_eq!(config.timing.disconnect_grace_ms, 2000);
    }

    #[test]
    fn test_partial_timing_table() {
        let config = AppConfig::parse(
            r#"
            device_address = "AA:BB:CC:DD:EE:FF"

            [timing]
            settle_delay_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.device_address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        let timing = config.timing();
        assert_eq!(timing.settle_delay, Duration::from_millis(500));
        assert_eq!(timing.command_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_uuid_overrides() {
        let config = AppConfig {
            write_uuid: Some("0000ff01-0000-1000-8000-00805f9b34fb".into()),
            notify_uuid: Some("not-a-uuid".into()),
            ..Default::default()
        };
        let uuids = config.uuids();
        assert_eq!(uuids.service, SERVICE_UUID);
        assert_eq!(
            uuids.write,
            Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb)
        );
        assert_eq!(uuids.notify, NOTIFY_UUID);
        assert_ne!(uuids.write, WRITE_UUID);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = AppConfig {
            device_address: Some("11:22:33:44:55:66".into()),
            device_name: Some("Fairbuds".into()),
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(!text.contains("service_uuid"));
        assert_eq!(AppConfig::parse(&text).unwrap(), config);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(AppConfig::parse("timing = 3").is_err());
    }
}
