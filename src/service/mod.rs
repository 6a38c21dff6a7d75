//! Service layer for the hub.
//!
//! `HubService` is the one surface callers use. It owns the registry and the
//! poll manager and applies configuration (aliases, default intervals) so the
//! layers below stay free of it.
//!
//! ```text
//! caller ──> HubService ─┬─> PortRegistry ──> PortSession ──> transport
//!                        └─> PollManager ───────┘
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::error::{HubError, HubResult};
use crate::events::{EventBus, EventSink, HubEvent};
use crate::poll::{PollKey, PollManager, PollState, TelemetryRegion};
use crate::port::{self, AvailablePort, PortOpener, PortSettings, SystemPortOpener};
use crate::registry::{PortId, PortRegistry};
use crate::session::Reply;

pub struct HubService {
    registry: Arc<PortRegistry>,
    polls: PollManager,
    config: Config,
}

impl HubService {
    /// Build a service that opens ports through `opener`.
    pub fn new(opener: Arc<dyn PortOpener>, config: Config) -> Self {
        let events = EventBus::new(config.events.capacity);
        let registry = Arc::new(PortRegistry::new(
            opener,
            config.serial.session_options(),
            events,
        ));
        let polls = PollManager::new(Arc::clone(&registry));
        Self {
            registry,
            polls,
            config,
        }
    }

    /// Build a service backed by the operating system's serial ports.
    pub fn with_system_ports(config: Config) -> Self {
        Self::new(Arc::new(SystemPortOpener), config)
    }

    /// Replace the polled telemetry regions. Only affects polls started afterwards.
    pub fn with_regions(mut self, regions: Vec<Arc<dyn TelemetryRegion>>) -> Self {
        self.polls = PollManager::with_regions(Arc::clone(&self.registry), regions);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    pub fn polls(&self) -> &PollManager {
        &self.polls
    }

    /// Open a port; `settings.path` may be a configured alias.
    pub async fn open_port(&self, mut settings: PortSettings) -> HubResult<PortId> {
        settings.path = self.config.serial.resolve_port(&settings.path);
        self.registry.open(&settings).await
    }

    /// Stop the port's poll jobs, then close it.
    pub async fn close_port(&self, id: PortId) -> HubResult<()> {
        self.registry.get(id)?;
        let stopped = self.polls.stop_all_for_port(id).await;
        if stopped > 0 {
            info!(port_id = %id, stopped, "stopped polls before closing port");
        }
        self.registry.close(id).await
    }

    /// Fire-and-forget write. `Ok(true)` once the bytes are on the wire.
    pub async fn write(&self, id: PortId, data: &[u8]) -> HubResult<bool> {
        let session = self.registry.get(id)?;
        let reply = session.send(data, false).await?;
        Ok(reply == Reply::Sent)
    }

    /// Write and wait for the reply. `Ok(None)` means the response timed out.
    pub async fn write_and_wait(&self, id: PortId, data: &[u8]) -> HubResult<Option<Vec<u8>>> {
        let session = self.registry.get(id)?;
        Ok(session.send(data, true).await?.into_response())
    }

    pub fn is_open(&self, id: PortId) -> bool {
        self.registry.is_open(id)
    }

    /// Start polling; `interval` falls back to `[poll] default_interval_ms`.
    pub fn start_poll(
        &self,
        id: PortId,
        device_id: u8,
        interval: Option<Duration>,
    ) -> HubResult<bool> {
        let interval = interval.unwrap_or_else(|| self.config.poll.default_interval());
        self.polls.start(id, device_id, interval)
    }

    pub async fn stop_poll(&self, id: PortId, device_id: u8) -> HubResult<()> {
        self.polls.stop(id, device_id).await
    }

    pub async fn stop_all_polls(&self) -> usize {
        self.polls.stop_all().await
    }

    pub fn poll_state(&self, id: PortId, device_id: u8) -> PollState {
        self.polls.state(id, device_id)
    }

    pub fn running_polls(&self) -> Vec<PollKey> {
        self.polls.running_keys()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events().subscribe()
    }

    pub fn register_sink<S: EventSink>(&self, sink: S) -> JoinHandle<()> {
        self.events().register(sink)
    }

    /// Raw frames read on a port, solicited or not.
    pub fn subscribe_frames(&self, id: PortId) -> HubResult<broadcast::Receiver<Vec<u8>>> {
        Ok(self.registry.get(id)?.subscribe_frames())
    }

    /// Serial ports present on this machine.
    pub fn available_ports() -> HubResult<Vec<AvailablePort>> {
        port::available_ports().map_err(HubError::Enumerate)
    }

    /// Stop every poll and close every port.
    pub async fn shutdown(&self) {
        let polls = self.polls.stop_all().await;
        let ports = self.registry.len();
        self.registry.close_all().await;
        info!(polls, ports, "hub shut down");
    }

    fn events(&self) -> &EventBus {
        self.registry.events()
    }
}

impl std::fmt::Debug for HubService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubService")
            .field("registry", &self.registry)
            .field("polls", &self.polls)
            .finish()
    }
}
