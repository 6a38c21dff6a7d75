//! Servo Serial Hub
//!
//! Multiplexes callers and background telemetry polls onto half-duplex serial
//! buses of daisy-chained servos.
//!
//! # Modules
//!
//! - `port`: driver traits, the system serial port, and a mock device
//! - `frame`: reply validation and request encoding
//! - `session`: one open port, with request/response correlation
//! - `registry`: open sessions keyed by `PortId`
//! - `poll`: cancellable periodic telemetry jobs
//! - `events`: fan-out of faults and telemetry
//! - `service`: the caller-facing `HubService`
//! - `config`: TOML configuration with environment overrides
//! - `error`: unified error handling

pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod poll;
pub mod port;
pub mod registry;
pub mod service;
pub mod session;

pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
pub use error::{HubError, HubResult};
pub use events::{EventBus, EventSink, HubEvent, SinkError};
pub use frame::ErrorCode;
pub use poll::{PollKey, PollManager, PollState, TelemetryKind, TelemetryRecord, TelemetryRegion};
pub use port::{
    MockPortOpener, MockSerialPort, PortError, PortOpener, PortSettings, SerialPortAdapter,
};
pub use registry::{PortId, PortRegistry};
pub use service::HubService;
pub use session::{PortSession, Reply, SessionError, SessionOptions};
