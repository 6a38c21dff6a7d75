//! Configuration schema definitions.
//!
//! Every section is `#[serde(default)]`, so a file only needs the keys it
//! changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::error::{ConfigError, ConfigResult};
use crate::port::settings::DEFAULT_BAUD_RATE;
use crate::session::{
    SessionOptions, DEFAULT_FRAME_QUEUE_CAPACITY, DEFAULT_READ_POLL_INTERVAL,
    DEFAULT_RESPONSE_TIMEOUT,
};

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub poll: PollConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Reject values that would stall or spin the core.
    pub fn validate(&self) -> ConfigResult<()> {
        let nonzero = [
            ("serial.default_baud", self.serial.default_baud as u64),
            ("serial.response_timeout_ms", self.serial.response_timeout_ms),
            ("serial.read_poll_interval_ms", self.serial.read_poll_interval_ms),
            (
                "serial.frame_queue_capacity",
                self.serial.frame_queue_capacity as u64,
            ),
            ("poll.default_interval_ms", self.poll.default_interval_ms),
            ("events.capacity", self.events.capacity as u64),
        ];
        for (key, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::validation(key, "must be greater than zero"));
            }
        }
        Ok(())
    }
}

/// Serial port and session defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate the CLI uses when none is given
    pub default_baud: u32,
    /// Write-and-wait timeout
    pub response_timeout_ms: u64,
    /// Read loop sleep when no bytes are buffered
    pub read_poll_interval_ms: u64,
    /// Raw inbound frames buffered per observer
    pub frame_queue_capacity: usize,
    /// Friendly names for device paths
    pub port_aliases: HashMap<String, String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud: DEFAULT_BAUD_RATE,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            read_poll_interval_ms: DEFAULT_READ_POLL_INTERVAL.as_millis() as u64,
            frame_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            port_aliases: HashMap::new(),
        }
    }
}

impl SerialConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_interval_ms)
    }

    /// Resolve a port name through aliases
    pub fn resolve_port(&self, name: &str) -> String {
        self.port_aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            response_timeout: self.response_timeout(),
            read_poll_interval: self.read_poll_interval(),
            frame_queue_capacity: self.frame_queue_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Interval used when `start_poll` is not given one
    pub default_interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 1000,
        }
    }
}

impl PollConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest are dropped
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.serial.response_timeout_ms, 3000);
        assert_eq!(config.serial.read_poll_interval_ms, 10);
        assert_eq!(config.poll.default_interval_ms, 1000);
        assert_eq!(config.events.capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_alias_resolution() {
        let mut config = SerialConfig::default();
        config
            .port_aliases
            .insert("arm".to_string(), "/dev/ttyUSB0".to_string());

        assert_eq!(config.resolve_port("arm"), "/dev/ttyUSB0");
        assert_eq!(config.resolve_port("COM5"), "COM5");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let toml_str = r#"
            [serial]
            default_baud = 1000000

            [serial.port_aliases]
            arm = "/dev/ttyUSB1"

            [logging]
            format = "json"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.serial.default_baud, 1_000_000);
        assert_eq!(config.serial.resolve_port("arm"), "/dev/ttyUSB1");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.serial.response_timeout_ms, 3000);
        assert_eq!(config.poll, PollConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.poll.default_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("poll.default_interval_ms"));

        let mut config = Config::default();
        config.events.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_options_follow_serial_section() {
        let serial = SerialConfig {
            response_timeout_ms: 250,
            ..SerialConfig::default()
        };
        let options = serial.session_options();
        assert_eq!(options.response_timeout, Duration::from_millis(250));
        assert_eq!(options.read_poll_interval, Duration::from_millis(10));
    }
}
