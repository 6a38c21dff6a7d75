//! Raw open requests and their validation.
//!
//! `PortSettings` is what callers send (strings and small integers, the way a
//! JSON body or a TOML file spells them). `validate` turns it into a typed
//! `PortConfiguration` or rejects it before any transport call is made.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::traits::{DataBits, FlowControl, Parity, PortConfiguration, StopBits};
use crate::error::{HubError, HubResult};

// Default configuration constants
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default baud rate for serial port configuration (9600 bps).
pub fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

/// Default driver timeout (1000 ms).
pub fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

pub fn default_parity() -> String {
    "none".into()
}

pub fn default_data_bits() -> u8 {
    8
}

pub fn default_stop_bits() -> u8 {
    1
}

pub fn default_flow_control() -> String {
    "none".into()
}

/// An open request as supplied by a caller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// `none`, `odd`, `even`, `mark` or `space`.
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// 1, 2, or 3 for one-and-a-half.
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// `none`, `software` or `hardware`.
    #[serde(default = "default_flow_control")]
    pub flow_control: String,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Overrides the configured write-and-wait timeout for this port.
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
}

impl PortSettings {
    /// Settings for `path` with every other field at its default.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: default_baud(),
            parity: default_parity(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            flow_control: default_flow_control(),
            timeout_ms: default_timeout(),
            response_timeout_ms: None,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Check every field and build the driver configuration.
    ///
    /// # Errors
    ///
    /// `HubError::Config` for an empty path, a zero baud rate, or any value the
    /// driver cannot express. Mark/space parity and 1.5 stop bits are known
    /// line settings but unsupported by the serial backend, so they are
    /// reported as unsupported rather than invalid.
    pub fn validate(&self) -> HubResult<PortConfiguration> {
        if self.path.trim().is_empty() {
            return Err(HubError::config("device path must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(HubError::config("baud rate must be greater than zero"));
        }

        let parity = match self.parity.to_ascii_lowercase().as_str() {
            "none" => Parity::None,
            "odd" => Parity::Odd,
            "even" => Parity::Even,
            "mark" | "space" => {
                return Err(HubError::config(format!(
                    "unsupported parity: {}",
                    self.parity
                )))
            }
            other => return Err(HubError::config(format!("invalid parity: {other}"))),
        };

        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => return Err(HubError::config(format!("unsupported data bits: {other}"))),
        };

        let stop_bits = match self.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            3 => return Err(HubError::config("unsupported stop bits: 1.5")),
            other => return Err(HubError::config(format!("unsupported stop bits: {other}"))),
        };

        let flow_control = match self.flow_control.to_ascii_lowercase().as_str() {
            "none" => FlowControl::None,
            "software" => FlowControl::Software,
            "hardware" => FlowControl::Hardware,
            other => return Err(HubError::config(format!("unsupported flow control: {other}"))),
        };

        Ok(PortConfiguration {
            baud_rate: self.baud_rate,
            data_bits,
            flow_control,
            parity,
            stop_bits,
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_minimal_json() {
        let settings: PortSettings = serde_json::from_str(r#"{"path": "/dev/ttyUSB0"}"#).unwrap();
        assert_eq!(settings, PortSettings::new("/dev/ttyUSB0"));

        let config = settings.validate().unwrap();
        assert_eq!(config, PortConfiguration::default());
    }

    #[test]
    fn test_full_settings() {
        let json = r#"{
            "path": "COM7",
            "baud_rate": 1000000,
            "parity": "Even",
            "data_bits": 7,
            "stop_bits": 2,
            "flow_control": "hardware",
            "timeout_ms": 250,
            "response_timeout_ms": 500
        }"#;
        let settings: PortSettings = serde_json::from_str(json).unwrap();
        let config = settings.validate().unwrap();

        assert_eq!(config.baud_rate, 1_000_000);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.data_bits, DataBits::Seven);
        assert_eq!(config.stop_bits, StopBits::Two);
        assert_eq!(config.flow_control, FlowControl::Hardware);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(settings.response_timeout_ms, Some(500));
    }

    #[test]
    fn test_rejects_unsupported_values() {
        let base = PortSettings::new("/dev/ttyUSB0");

        let cases = [
            PortSettings { parity: "mark".into(), ..base.clone() },
            PortSettings { parity: "bogus".into(), ..base.clone() },
            PortSettings { data_bits: 9, ..base.clone() },
            PortSettings { stop_bits: 3, ..base.clone() },
            PortSettings { flow_control: "rtscts".into(), ..base.clone() },
            PortSettings { baud_rate: 0, ..base.clone() },
            PortSettings { path: "  ".into(), ..base.clone() },
        ];

        for settings in cases {
            let err = settings.validate().unwrap_err();
            assert!(matches!(err, HubError::Config(_)), "{settings:?} gave {err:?}");
        }
    }
}
