//! Configuration loader with file resolution and environment override support.

use super::error::{ConfigError, ConfigResult};
use super::schema::{Config, LogFormat};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "SERVO_HUB";

const CONFIG_FILE_NAME: &str = "servo-hub.toml";

/// Environment variable for explicit config path
const CONFIG_PATH_ENV: &str = "SERVO_HUB_CONFIG";

const APP_DIR: &str = "servo-hub";

/// Configuration loader with resolution and override logic.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Resolved config file path (if any)
    pub config_path: Option<PathBuf>,
    pub config: Config,
}

impl ConfigLoader {
    /// Load configuration using standard resolution order.
    ///
    /// Resolution priority (highest to lowest):
    /// 1. `SERVO_HUB_CONFIG` environment variable (explicit path)
    /// 2. `./servo-hub.toml`
    /// 3. `$XDG_CONFIG_HOME/servo-hub/servo-hub.toml` (`%APPDATA%` on Windows)
    /// 4. Built-in defaults
    ///
    /// Environment variables override file values, and the result is validated.
    pub fn load() -> ConfigResult<Self> {
        let config_path = resolve_config_path();

        let mut config = match config_path {
            Some(ref path) => load_from_file(path)?,
            None => Config::default(),
        };
        apply_env_overrides(&mut config)?;
        config.validate()?;

        debug!(path = ?config_path, "configuration loaded");
        Ok(Self {
            config_path,
            config,
        })
    }

    /// Load configuration from a specific file path.
    ///
    /// Unlike [`load`](Self::load), a missing file is an error.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        let mut config = load_from_file(&path)?;
        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self {
            config_path: Some(path),
            config,
        })
    }

    /// Built-in defaults, with env overrides that parse applied.
    pub fn with_defaults() -> Self {
        let mut config = Config::default();
        let _ = apply_env_overrides(&mut config);

        Self {
            config_path: None,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Save the current configuration to a specific file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        save_to_file(&self.config, path.as_ref())
    }
}

/// Resolve the configuration file path using standard locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let cwd_config = PathBuf::from(CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    get_default_config_path().filter(|p| p.exists())
}

/// Get the platform-specific config directory.
fn get_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

/// Where a new config file would go.
pub fn get_default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE_NAME))
}

fn load_from_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(ConfigError::ParseError)
}

fn save_to_file(config: &Config, path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read `SERVO_HUB_<key>` and parse it, if set.
fn env_value<T: FromStr>(key: &str, what: &str) -> ConfigResult<Option<T>> {
    let var = format!("{}_{}", ENV_PREFIX, key);
    match std::env::var(&var) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::env_parse(var, format!("Invalid {what}"))),
        Err(_) => Ok(None),
    }
}

/// Apply environment variable overrides to the configuration.
///
/// Variables follow the pattern `SERVO_HUB_<SECTION>_<KEY>`, for example
/// `SERVO_HUB_SERIAL_RESPONSE_TIMEOUT_MS=500` or `SERVO_HUB_LOGGING_FORMAT=json`.
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    if let Some(v) = env_value("SERIAL_DEFAULT_BAUD", "baud rate")? {
        config.serial.default_baud = v;
    }
    if let Some(v) = env_value("SERIAL_RESPONSE_TIMEOUT_MS", "timeout")? {
        config.serial.response_timeout_ms = v;
    }
    if let Some(v) = env_value("SERIAL_READ_POLL_INTERVAL_MS", "interval")? {
        config.serial.read_poll_interval_ms = v;
    }
    if let Some(v) = env_value("SERIAL_FRAME_QUEUE_CAPACITY", "capacity")? {
        config.serial.frame_queue_capacity = v;
    }
    if let Some(v) = env_value("POLL_DEFAULT_INTERVAL_MS", "interval")? {
        config.poll.default_interval_ms = v;
    }
    if let Some(v) = env_value("EVENTS_CAPACITY", "capacity")? {
        config.events.capacity = v;
    }
    if let Some(v) = env_value::<String>("LOGGING_LEVEL", "log level")? {
        config.logging.level = v;
    }
    if let Some(v) = env_value::<String>("LOGGING_FORMAT", "log format")? {
        config.logging.format = match v.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => {
                return Err(ConfigError::env_parse(
                    format!("{}_LOGGING_FORMAT", ENV_PREFIX),
                    "expected json, pretty or compact",
                ))
            }
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_default_loader() {
        let loader = ConfigLoader::with_defaults();
        assert_eq!(loader.config().serial.response_timeout_ms, 3000);
        assert!(loader.config_path.is_none());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        env::set_var("SERVO_HUB_SERIAL_RESPONSE_TIMEOUT_MS", "750");
        env::set_var("SERVO_HUB_LOGGING_FORMAT", "compact");

        let loader = ConfigLoader::with_defaults();
        assert_eq!(loader.config().serial.response_timeout_ms, 750);
        assert_eq!(loader.config().logging.format, LogFormat::Compact);

        env::remove_var("SERVO_HUB_SERIAL_RESPONSE_TIMEOUT_MS");
        env::remove_var("SERVO_HUB_LOGGING_FORMAT");
    }

    #[test]
    #[serial]
    fn test_bad_env_value_is_reported() {
        env::set_var("SERVO_HUB_EVENTS_CAPACITY", "lots");
        let mut config = Config::default();
        let err = apply_env_overrides(&mut config).unwrap_err();
        env::remove_var("SERVO_HUB_EVENTS_CAPACITY");

        assert!(matches!(err, ConfigError::EnvParseError { ref var, .. } if var == "SERVO_HUB_EVENTS_CAPACITY"));
    }

    #[test]
    #[serial]
    fn test_load_from_file_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servo-hub.toml");
        std::fs::write(&path, "[poll]\ndefault_interval_ms = 250\n").unwrap();

        let loader = ConfigLoader::load_from(&path).unwrap();
        assert_eq!(loader.config().poll.default_interval_ms, 250);
        assert_eq!(loader.config_path.as_deref(), Some(path.as_path()));

        let copy = dir.path().join("nested").join("copy.toml");
        loader.save_to(&copy).unwrap();
        let reloaded = ConfigLoader::load_from(&copy).unwrap();
        assert_eq!(reloaded.config(), loader.config());
    }

    #[test]
    #[serial]
    fn test_load_from_rejects_missing_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            ConfigLoader::load_from(&missing),
            Err(ConfigError::NotFound(_))
        ));

        let zero = dir.path().join("zero.toml");
        std::fs::write(&zero, "[events]\ncapacity = 0\n").unwrap();
        assert!(matches!(
            ConfigLoader::load_from(&zero),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_explicit_path_env_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[serial]\ndefault_baud = 57600\n").unwrap();

        env::set_var(CONFIG_PATH_ENV, &path);
        let loader = ConfigLoader::load();
        env::remove_var(CONFIG_PATH_ENV);

        let loader = loader.unwrap();
        assert_eq!(loader.config().serial.default_baud, 57600);
        assert_eq!(loader.config_path, Some(path));
    }
}
