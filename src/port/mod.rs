//! Transport abstraction for serial communication.
//!
//! Provides the driver traits the session layer is written against, the
//! `serialport`-backed implementation, a mock device for tests, and the
//! validation of caller-supplied line settings.

pub mod error;
pub mod mock;
pub mod settings;
pub mod sync_port;
pub mod traits;

pub use error::PortError;
pub use mock::{MockPortOpener, MockSerialPort};
pub use settings::PortSettings;
pub use sync_port::{available_ports, AvailablePort, SyncSerialPort, SystemPortOpener};
pub use traits::*;
