//! Registry of open port sessions.
//!
//! Opening is idempotent per device path: a second `open` for a path whose
//! session is still live returns the existing id. Mutations (open, close)
//! are serialised so two concurrent opens of the same path cannot both reach
//! the driver; lookups only take a read lock.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{HubError, HubResult};
use crate::events::EventBus;
use crate::port::{PortError, PortOpener, PortSettings};
use crate::session::{PortSession, SessionOptions};

/// Opaque identifier handed out by [`PortRegistry::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(Uuid);

impl PortId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PortId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PortId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Owns every live [`PortSession`].
pub struct PortRegistry {
    opener: Arc<dyn PortOpener>,
    sessions: RwLock<HashMap<PortId, Arc<PortSession>>>,
    /// Serialises open/close so path lookups and inserts are atomic.
    mutation: tokio::sync::Mutex<()>,
    options: SessionOptions,
    events: EventBus,
}

impl PortRegistry {
    pub fn new(opener: Arc<dyn PortOpener>, options: SessionOptions, events: EventBus) -> Self {
        Self {
            opener,
            sessions: RwLock::new(HashMap::new()),
            mutation: tokio::sync::Mutex::new(()),
            options,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Open `settings.path`, or return the id of its live session.
    ///
    /// A session whose transport has gone away (closed underneath us, or
    /// faulted) is closed and replaced by a fresh one with a new id.
    ///
    /// # Errors
    ///
    /// - `HubError::Config` if the settings are invalid; the driver is not called
    /// - `HubError::TransportOpen` if the driver fails to open the device
    pub async fn open(&self, settings: &PortSettings) -> HubResult<PortId> {
        let config = settings.validate()?;
        let _guard = self.mutation.lock().await;

        if let Some(existing) = self.find_by_path(&settings.path) {
            if existing.is_open() {
                debug!(port_id = %existing.id(), path = %settings.path, "port already open");
                return Ok(existing.id());
            }
            warn!(
                port_id = %existing.id(),
                path = %settings.path,
                "replacing stale session"
            );
            self.sessions.write().remove(&existing.id());
            existing.close().await;
        }

        let opener = Arc::clone(&self.opener);
        let path = settings.path.clone();
        let transport = tokio::task::spawn_blocking(move || opener.open(&path, &config))
            .await
            .unwrap_or_else(|e| Err(PortError::Io(std::io::Error::other(e))))
            .map_err(|source| HubError::TransportOpen {
                path: settings.path.clone(),
                source,
            })?;

        let mut options = self.options.clone();
        if let Some(ms) = settings.response_timeout_ms {
            options.response_timeout = Duration::from_millis(ms);
        }

        let id = PortId::new();
        let session = PortSession::new(id, &settings.path, transport, options, self.events.clone());
        session.start();
        self.sessions.write().insert(id, session);

        info!(
            port_id = %id,
            path = %settings.path,
            baud_rate = settings.baud_rate,
            "port opened"
        );
        Ok(id)
    }

    /// Close and forget a session. Any caller waiting on it is released.
    pub async fn close(&self, id: PortId) -> HubResult<()> {
        let _guard = self.mutation.lock().await;
        let session = self
            .sessions
            .write()
            .remove(&id)
            .ok_or(HubError::PortNotFound(id))?;
        session.close().await;
        Ok(())
    }

    /// Close every session; used on shutdown.
    pub async fn close_all(&self) {
        let _guard = self.mutation.lock().await;
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }

    pub fn get(&self, id: PortId) -> HubResult<Arc<PortSession>> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(HubError::PortNotFound(id))
    }

    /// False for unknown ids as well as for dead sessions.
    pub fn is_open(&self, id: PortId) -> bool {
        self.sessions
            .read()
            .get(&id)
            .is_some_and(|session| session.is_open())
    }

    pub fn ids(&self) -> Vec<PortId> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn find_by_path(&self, path: &str) -> Option<Arc<PortSession>> {
        self.sessions
            .read()
            .values()
            .find(|session| session.path() == path)
            .cloned()
    }
}

impl fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MockPortOpener, MockSerialPort, SerialPortAdapter};
    use pretty_assertions::assert_eq;

    fn registry(opener: &MockPortOpener) -> PortRegistry {
        PortRegistry::new(
            Arc::new(opener.clone()),
            SessionOptions::default(),
            EventBus::new(16),
        )
    }

    #[test]
    fn test_port_id_round_trips_through_string() {
        let id = PortId::new();
        let parsed: PortId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<PortId>().is_err());
    }

    #[tokio::test]
    async fn test_open_is_idempotent_per_path() {
        let opener = MockPortOpener::new();
        let registry = registry(&opener);
        let settings = PortSettings::new("/dev/ttyUSB0");

        let first = registry.open(&settings).await.unwrap();
        let second = registry.open(&settings).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(opener.opened(), vec!["/dev/ttyUSB0".to_string()]);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_stale_session_is_replaced() {
        let opener = MockPortOpener::new();
        let device = MockSerialPort::new("/dev/ttyUSB0");
        opener.insert("/dev/ttyUSB0", device.clone());
        let registry = registry(&opener);
        let settings = PortSettings::new("/dev/ttyUSB0");

        let first = registry.open(&settings).await.unwrap();
        device.disconnect();
        for _ in 0..50 {
            if !registry.is_open(first) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!registry.is_open(first));

        let second = registry.open(&settings).await.unwrap();
        assert_ne!(first, second);
        assert!(registry.is_open(second));
        assert_eq!(registry.ids(), vec![second]);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_invalid_settings_never_reach_the_driver() {
        let opener = MockPortOpener::new();
        let registry = registry(&opener);
        let settings = PortSettings::new("/dev/ttyUSB0").with_baud_rate(0);

        let err = registry.open(&settings).await.unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
        assert!(opener.opened().is_empty());
    }

    #[tokio::test]
    async fn test_driver_failure_is_transport_open_error() {
        let opener = MockPortOpener::new();
        opener.fail_path("/dev/missing");
        let registry = registry(&opener);

        let err = registry
            .open(&PortSettings::new("/dev/missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::TransportOpen { ref path, .. } if path == "/dev/missing"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_unknown_and_is_open_unknown() {
        let registry = registry(&MockPortOpener::new());
        let id = PortId::new();
        assert!(matches!(registry.close(id).await, Err(HubError::PortNotFound(x)) if x == id));
        assert!(!registry.is_open(id));
        assert!(registry.get(id).is_err());
    }

    #[tokio::test]
    async fn test_close_closes_transport() {
        let opener = MockPortOpener::new();
        let device = MockSerialPort::new("COM3");
        opener.insert("COM3", device.clone());
        let registry = registry(&opener);

        let id = registry.open(&PortSettings::new("COM3")).await.unwrap();
        registry.close(id).await.unwrap();

        assert_eq!(device.close_count(), 1);
        assert!(!device.is_open());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_response_timeout_override() {
        let registry = registry(&MockPortOpener::new());
        let settings =
            PortSettings::new("COM4").with_response_timeout(Duration::from_millis(250));
        let id = registry.open(&settings).await.unwrap();
        assert_eq!(
            registry.get(id).unwrap().response_timeout(),
            Duration::from_millis(250)
        );
        registry.close_all().await;
    }
}
