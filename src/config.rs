//! Startup configuration.
//!
//! The pipeline consumes one immutable [`Config`] value, loaded from a JSON
//! file at startup and passed by reference into each component's
//! constructor. There is no process-wide configuration singleton; a
//! component that needs a setting receives it explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration, mirroring the sections of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub can: CanConfig,
    pub database: DatabaseConfig,
    pub influxdb: InfluxConfig,
    pub bluetooth: BluetoothConfig,
    pub ui: UiConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| Error::ConfigFile { path: path.to_path_buf(), source })?;
        serde_json::from_str(&raw)
            .map_err(|source| Error::ConfigParse { path: path.to_path_buf(), source })
    }
}

/// CAN adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// Adapter kind: `"socketcan"` for hardware, `"virtual"` for the
    /// in-process bus.
    pub interface: String,
    /// Interface/channel name, e.g. `can0`.
    pub channel: String,
    /// Bus bitrate in bit/s.
    pub bitrate: u32,
    /// Reconnect automatically after bus-off or device loss.
    pub enable_auto_restart: bool,
    /// Read timeout before the link reports [`LinkError::Timeout`].
    ///
    /// [`LinkError::Timeout`]: crate::error::LinkError::Timeout
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: "socketcan".to_string(),
            channel: "can0".to_string(),
            bitrate: 500_000,
            enable_auto_restart: true,
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// Durable (SQLite) store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Whether the periodic backup task runs.
    pub backup_enabled: bool,
    /// Interval between backups.
    pub backup_interval_hours: u32,
    /// Commit a batch after this many buffered frames.
    pub batch_size: usize,
    /// Commit a batch after this long even if not full.
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("db/canflow.db"),
            backup_enabled: true,
            backup_interval_hours: 24,
            batch_size: 256,
            flush_interval: Duration::from_millis(500),
        }
    }
}

/// Time-series (InfluxDB v2 compatible) store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub org: String,
    pub bucket: String,
    pub token: String,
    /// Retention as an Influx duration literal, e.g. `"2w"`.
    pub retention_policy: String,
    /// Write a batch after this many buffered points.
    pub batch_size: usize,
    /// Write a batch after this long even if not full.
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
    /// Maximum points buffered in memory while the backend is unreachable.
    pub pending_cap: usize,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 8086,
            org: "canflow".to_string(),
            bucket: "canbus_data".to_string(),
            token: String::new(),
            retention_policy: "2w".to_string(),
            batch_size: 500,
            flush_interval: Duration::from_millis(1000),
            pending_cap: 10_000,
        }
    }
}

impl InfluxConfig {
    /// Base URL of the backend, e.g. `http://localhost:8086`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Parse the configured retention literal.
    pub fn retention(&self) -> Result<RetentionPolicy> {
        RetentionPolicy::parse(&self.retention_policy)
    }
}

/// Relay collaborator settings. Pairing and radio management belong to the
/// collaborator; the core only needs the pre-shared PIN.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub enabled: bool,
    pub device_name: String,
    pub pin: String,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self { enabled: false, device_name: "canflow".to_string(), pin: "1234".to_string() }
    }
}

/// UI collaborator settings. Only the refresh interval matters to the core:
/// it throttles the live subscriber feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub refresh_rate_ms: u64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { refresh_rate_ms: 500 }
    }
}

impl UiConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_rate_ms)
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter, overridable via `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Install a global tracing subscriber honoring the configured level.
///
/// Call once at application startup; later calls are ignored so tests can
/// install their own subscribers freely.
pub fn init_tracing(logging: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// How long the time-series store keeps points before they become eligible
/// for deletion. Enforced by the backend, declared here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    duration: Duration,
}

impl RetentionPolicy {
    /// Parse an Influx duration literal: an integer followed by one of
    /// `s`, `m`, `h`, `d`, `w`. `"0"` or `"infinite"` mean no expiry.
    pub fn parse(literal: &str) -> Result<Self> {
        let literal = literal.trim();
        if literal == "0" || literal.eq_ignore_ascii_case("infinite") {
            return Ok(Self { duration: Duration::ZERO });
        }

        let split = literal
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::InvalidRetention { literal: literal.to_string() })?;
        let (digits, unit) = literal.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| Error::InvalidRetention { literal: literal.to_string() })?;

        let secs = match unit {
            "s" => value,
            "m" => value * 60,
            "h" => value * 3600,
            "d" => value * 86_400,
            "w" => value * 7 * 86_400,
            _ => return Err(Error::InvalidRetention { literal: literal.to_string() }),
        };
        Ok(Self { duration: Duration::from_secs(secs) })
    }

    /// Retention duration; zero means keep forever.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Expiry in whole seconds, as the bucket API expects (0 = never).
    pub fn expire_seconds(&self) -> u64 {
        self.duration.as_secs()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_literal_parsing() {
        assert_eq!(
            RetentionPolicy::parse("2w").unwrap().duration(),
            Duration::from_secs(2 * 7 * 86_400)
        );
        assert_eq!(RetentionPolicy::parse("3d").unwrap().duration(), Duration::from_secs(259_200));
        assert_eq!(RetentionPolicy::parse("12h").unwrap().duration(), Duration::from_secs(43_200));
        assert_eq!(RetentionPolicy::parse("90s").unwrap().duration(), Duration::from_secs(90));
        assert_eq!(RetentionPolicy::parse("0").unwrap().duration(), Duration::ZERO);
        assert_eq!(RetentionPolicy::parse("infinite").unwrap().duration(), Duration::ZERO);

        assert!(RetentionPolicy::parse("2y").is_err());
        assert!(RetentionPolicy::parse("w2").is_err());
        assert!(RetentionPolicy::parse("").is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.can.channel, "can0");
        assert_eq!(back.can.bitrate, 500_000);
        assert_eq!(back.influxdb.retention_policy, "2w");
        assert_eq!(back.database.backup_interval_hours, 24);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let json = r#"{"can": {"interface": "virtual", "channel": "vcan0"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.can.interface, "virtual");
        assert_eq!(config.can.channel, "vcan0");
        // Untouched sections keep their defaults
        assert_eq!(config.can.bitrate, 500_000);
        assert!(config.can.enable_auto_restart);
        assert_eq!(config.influxdb.port, 8086);
        assert_eq!(config.ui.refresh_rate_ms, 500);
    }
}
