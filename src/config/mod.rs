//! TOML configuration with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! 1. `SERVO_HUB_CONFIG` environment variable (explicit path)
//! 2. `./servo-hub.toml` (current directory)
//! 3. `$XDG_CONFIG_HOME/servo-hub/servo-hub.toml` (`%APPDATA%` on Windows)
//! 4. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! The pattern is `SERVO_HUB_<SECTION>_<KEY>`:
//! - `SERVO_HUB_SERIAL_RESPONSE_TIMEOUT_MS=500`
//! - `SERVO_HUB_POLL_DEFAULT_INTERVAL_MS=200`
//! - `SERVO_HUB_LOGGING_FORMAT=json`
//!
//! # Example
//!
//! ```rust,no_run
//! use servo_serial_hub::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! println!("Response timeout: {:?}", loader.config().serial.response_timeout());
//! # Ok::<(), servo_serial_hub::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{get_default_config_path, resolve_config_path, ConfigLoader};
pub use schema::{Config, EventsConfig, LogFormat, LoggingConfig, PollConfig, SerialConfig};
