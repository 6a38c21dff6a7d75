//! Background telemetry polling.
//!
//! A poll job is keyed by `(port, device)` and runs one task per telemetry
//! region. All tasks of a job share a cancellation token, so they start and
//! stop together. Each task loops request, publish, sleep; both the request
//! and the sleep are cancellation points.
//!
//! Poll traffic goes through [`PortSession::send`](crate::session::PortSession::send)
//! like any interactive command, so the session's write lock interleaves the
//! two without extra coordination.

mod region;

pub use region::{
    default_regions, eeprom, position_degrees, ram, speed_rpm, EepromData, EepromRegion,
    RamData, RamRegion, TelemetryKind, TelemetryRecord, TelemetryRegion,
};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{HubError, HubResult};
use crate::events::{EventBus, HubEvent};
use crate::frame;
use crate::registry::{PortId, PortRegistry};
use crate::session::{Reply, SessionError};

/// Identifies a poll job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PollKey {
    pub port_id: PortId,
    pub device_id: u8,
}

impl PollKey {
    pub fn new(port_id: PortId, device_id: u8) -> Self {
        Self { port_id, device_id }
    }
}

impl fmt::Display for PollKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port_id, self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Stopped,
    Running,
    Stopping,
}

struct PollJob {
    state: PollState,
    token: CancellationToken,
    /// Cancelled once whoever is stopping the job is done with it.
    stopped: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl PollJob {
    /// Running with at least one task still alive, or mid-stop.
    fn is_live(&self) -> bool {
        match self.state {
            PollState::Running => self.handles.iter().any(|h| !h.is_finished()),
            PollState::Stopping => !self.stopped.is_cancelled(),
            PollState::Stopped => false,
        }
    }
}

/// Starts, tracks and cancels poll jobs.
pub struct PollManager {
    registry: Arc<PortRegistry>,
    events: EventBus,
    regions: Vec<Arc<dyn TelemetryRegion>>,
    jobs: Mutex<HashMap<PollKey, PollJob>>,
}

impl PollManager {
    /// Poll the EEPROM and RAM regions.
    pub fn new(registry: Arc<PortRegistry>) -> Self {
        Self::with_regions(registry, default_regions())
    }

    pub fn with_regions(registry: Arc<PortRegistry>, regions: Vec<Arc<dyn TelemetryRegion>>) -> Self {
        let events = registry.events().clone();
        Self {
            registry,
            events,
            regions,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `device_id` on `port_id` every `interval`.
    ///
    /// Returns `Ok(false)` without doing anything if the key is already
    /// running or still stopping.
    ///
    /// # Errors
    ///
    /// - `HubError::PortNotFound` if the port is not open
    /// - `HubError::Config` for a zero interval
    pub fn start(&self, port_id: PortId, device_id: u8, interval: Duration) -> HubResult<bool> {
        if interval.is_zero() {
            return Err(HubError::config("poll interval must be greater than zero"));
        }
        self.registry.get(port_id)?;

        let key = PollKey::new(port_id, device_id);
        let mut jobs = self.jobs.lock();
        prune_finished(&mut jobs);
        if let Some(job) = jobs.get(&key) {
            if job.is_live() {
                warn!(key = %key, state = ?job.state, "poll already running");
                return Ok(false);
            }
        }

        let token = CancellationToken::new();
        let handles = self
            .regions
            .iter()
            .map(|region| {
                let task = PollTask {
                    registry: Arc::clone(&self.registry),
                    events: self.events.clone(),
                    region: Arc::clone(region),
                    key,
                    interval,
                    token: token.clone(),
                };
                tokio::spawn(task.run())
            })
            .collect();

        jobs.insert(
            key,
            PollJob {
                state: PollState::Running,
                token,
                stopped: CancellationToken::new(),
                handles,
            },
        );
        info!(key = %key, interval_ms = interval.as_millis() as u64, "poll started");
        Ok(true)
    }

    /// Cancel a job and wait for its tasks to finish.
    ///
    /// An in-flight request is abandoned; the session's write lock is
    /// released when the request future is dropped. If another caller is
    /// already stopping the job, this waits for that stop to complete.
    pub async fn stop(&self, port_id: PortId, device_id: u8) -> HubResult<()> {
        let key = PollKey::new(port_id, device_id);
        if !self.jobs.lock().contains_key(&key) {
            return Err(HubError::PollNotFound { port_id, device_id });
        }
        self.stop_where(|k| *k == key).await;
        Ok(())
    }

    /// Stop every job on `port_id`. Returns how many were stopped.
    pub async fn stop_all_for_port(&self, port_id: PortId) -> usize {
        self.stop_where(|k| k.port_id == port_id).await
    }

    pub async fn stop_all(&self) -> usize {
        self.stop_where(|_| true).await
    }

    /// `Stopped` for unknown keys and for jobs whose tasks have all exited.
    pub fn state(&self, port_id: PortId, device_id: u8) -> PollState {
        match self.jobs.lock().get(&PollKey::new(port_id, device_id)) {
            Some(job) if job.is_live() => job.state,
            _ => PollState::Stopped,
        }
    }

    pub fn running_keys(&self) -> Vec<PollKey> {
        self.jobs
            .lock()
            .iter()
            .filter(|(_, job)| job.state == PollState::Running && job.is_live())
            .map(|(key, _)| *key)
            .collect()
    }

    async fn stop_where(&self, matches: impl Fn(&PollKey) -> bool) -> usize {
        let mut stopping = Vec::new();
        let mut in_progress = Vec::new();
        {
            let mut jobs = self.jobs.lock();
            for (key, job) in jobs.iter_mut() {
                if !matches(key) {
                    continue;
                }
                if job.state == PollState::Stopping {
                    in_progress.push((*key, job.stopped.clone()));
                } else {
                    job.state = PollState::Stopping;
                    job.token.cancel();
                    // Dropping the guard wakes concurrent stoppers, even if
                    // this future is abandoned half way.
                    let done = job.stopped.clone().drop_guard();
                    stopping.push((*key, std::mem::take(&mut job.handles), done));
                }
            }
        }

        let mut finished = Vec::with_capacity(stopping.len());
        for (key, handles, done) in stopping {
            for handle in handles {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!(key = %key, "poll task panicked");
                    }
                }
            }
            finished.push((key, done));
        }

        let stopped = finished.len();
        {
            let mut jobs = self.jobs.lock();
            for (key, _) in &finished {
                jobs.remove(key);
                info!(key = %key, "poll stopped");
            }
        }
        drop(finished);

        for (key, done) in in_progress {
            done.cancelled().await;
            // Left behind only if the other stopper was dropped mid-stop.
            let mut jobs = self.jobs.lock();
            if jobs
                .get(&key)
                .is_some_and(|job| job.state == PollState::Stopping && job.stopped.is_cancelled())
            {
                jobs.remove(&key);
            }
        }
        stopped
    }
}

/// Forget jobs whose tasks all exited on their own, e.g. because their port
/// was closed without going through the poll manager.
fn prune_finished(jobs: &mut HashMap<PollKey, PollJob>) {
    jobs.retain(|key, job| {
        let live = job.is_live();
        if !live {
            debug!(key = %key, "pruning finished poll job");
        }
        live
    });
}

impl fmt::Debug for PollManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollManager")
            .field("regions", &self.regions)
            .field("jobs", &self.jobs.lock().len())
            .finish()
    }
}

/// One region of one poll job.
struct PollTask {
    registry: Arc<PortRegistry>,
    events: EventBus,
    region: Arc<dyn TelemetryRegion>,
    key: PollKey,
    interval: Duration,
    token: CancellationToken,
}

impl PollTask {
    async fn run(self) {
        let kind = self.region.kind();
        let request = self.region.build_request(self.key.device_id);
        debug!(key = %self.key, ?kind, "poll task started");

        loop {
            let Ok(session) = self.registry.get(self.key.port_id) else {
                debug!(key = %self.key, "port no longer registered");
                break;
            };

            let outcome = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                outcome = session.send(&request, true) => outcome,
            };
            drop(session);

            match outcome {
                Ok(Reply::Response(bytes)) => {
                    match frame::payload(&bytes).and_then(|p| self.region.parse(p)) {
                        Ok(record) => self.events.publish(HubEvent::telemetry(
                            self.key.port_id,
                            self.key.device_id,
                            record,
                        )),
                        Err(code) => warn!(key = %self.key, ?kind, "telemetry rejected: {}", code),
                    }
                }
                Ok(Reply::TimedOut) => {
                    warn!(key = %self.key, ?kind, "no telemetry response");
                }
                Ok(Reply::Sent) => {}
                Err(e @ (SessionError::Closed | SessionError::Faulted(_))) => {
                    debug!(key = %self.key, "session unusable, poll task exiting: {}", e);
                    break;
                }
                Err(e) => warn!(key = %self.key, ?kind, "telemetry request failed: {}", e),
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!(key = %self.key, ?kind, "poll task stopped");
    }
}
