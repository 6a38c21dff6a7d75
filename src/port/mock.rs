//! Mock serial port implementation for testing.
//!
//! Provides a `MockSerialPort` that behaves like a device on the bus without
//! requiring hardware. It supports queued inbound bytes, a write log, an
//! optional responder that answers written frames (after an optional delay),
//! and fault injection for reads and writes.

use super::error::PortError;
use super::traits::{PortConfiguration, PortOpener, SerialPortAdapter};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Inner state of the mock port, shared between clones.
#[derive(Default)]
struct MockPortState {
    /// Bytes ready to be returned by read operations.
    read_queue: VecDeque<u8>,
    /// Replies that become readable once their deadline passes.
    delayed: Vec<(Instant, Vec<u8>)>,
    /// Log of all bytes written to the port.
    write_log: Vec<Vec<u8>>,
    /// Produces the device's reply to a written frame.
    responder: Option<Responder>,
    /// Delay applied to every responder reply.
    response_delay: Duration,
    /// Next `bytes_to_read` fails with this message.
    read_fault: Option<String>,
    /// Writes report one byte fewer than requested.
    short_writes: bool,
    closed: bool,
    close_count: u32,
}

impl MockPortState {
    fn promote_due(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, bytes) = self.delayed.remove(i);
                self.read_queue.extend(bytes);
            } else {
                i += 1;
            }
        }
    }
}

/// Mock serial port implementation for testing.
///
/// # Example
/// ```
/// use servo_serial_hub::port::{MockSerialPort, SerialPortAdapter};
///
/// let mut port = MockSerialPort::new("MOCK0");
/// port.set_responder(|frame| Some(frame.to_vec()));
///
/// port.write_bytes(b"ping").unwrap();
/// assert_eq!(port.bytes_to_read().unwrap(), 4);
///
/// let mut buffer = [0u8; 4];
/// let n = port.read_bytes(&mut buffer).unwrap();
/// assert_eq!(&buffer[..n], b"ping");
/// assert_eq!(port.get_write_log(), vec![b"ping".to_vec()]);
/// ```
#[derive(Clone)]
pub struct MockSerialPort {
    name: String,
    state: Arc<Mutex<MockPortState>>,
}

impl MockSerialPort {
    /// Create a new, open mock serial port with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockPortState::default())),
        }
    }

    /// Queue bytes as if the device had sent them unprompted.
    pub fn enqueue_read(&self, data: &[u8]) {
        self.state.lock().read_queue.extend(data);
    }

    /// Answer every written frame with whatever `responder` returns.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    /// Hold every responder reply back for `delay` before it becomes readable.
    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().response_delay = delay;
    }

    /// Make the next availability check fail, as a yanked USB adapter would.
    pub fn fail_next_read(&self, message: impl Into<String>) {
        self.state.lock().read_fault = Some(message.into());
    }

    /// Report every write as one byte short.
    pub fn set_short_writes(&self, short: bool) {
        self.state.lock().short_writes = short;
    }

    /// Close the device from outside, e.g. an unplugged cable.
    pub fn disconnect(&self) {
        self.state.lock().closed = true;
    }

    /// Get a copy of all data written to the port.
    pub fn get_write_log(&self) -> Vec<Vec<u8>> {
        self.state.lock().write_log.clone()
    }

    /// Clear the write log.
    pub fn clear_write_log(&self) {
        self.state.lock().write_log.clear();
    }

    /// How many times `close` released this port.
    pub fn close_count(&self) -> u32 {
        self.state.lock().close_count
    }

    fn reopen(&self) {
        self.state.lock().closed = false;
    }
}

impl SerialPortAdapter for MockSerialPort {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PortError::NotOpen);
        }

        state.write_log.push(data.to_vec());

        if let Some(reply) = state.responder.clone().and_then(|r| r(data)) {
            let due = Instant::now() + state.response_delay;
            state.delayed.push((due, reply));
            state.promote_due();
        }

        if state.short_writes {
            Ok(data.len().saturating_sub(1))
        } else {
            Ok(data.len())
        }
    }

    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, PortError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PortError::NotOpen);
        }
        state.promote_due();

        let mut bytes_read = 0;
        for byte in buffer.iter_mut() {
            match state.read_queue.pop_front() {
                Some(queued) => {
                    *byte = queued;
                    bytes_read += 1;
                }
                None => break,
            }
        }
        Ok(bytes_read)
    }

    fn bytes_to_read(&self) -> Result<usize, PortError> {
        let mut state = self.state.lock();
        if let Some(message) = state.read_fault.take() {
            return Err(PortError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                message,
            )));
        }
        if state.closed {
            return Err(PortError::NotOpen);
        }
        state.promote_due();
        Ok(state.read_queue.len())
    }

    fn clear_input(&mut self) -> Result<(), PortError> {
        let mut state = self.state.lock();
        state.promote_due();
        state.read_queue.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.state.lock().closed
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.close_count += 1;
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MockSerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockSerialPort")
            .field("name", &self.name)
            .field("available_bytes", &state.read_queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Hands out mock ports by path.
///
/// Ports registered with `insert` are returned (reopened) for their path so a
/// test can keep a handle to the device; any other path gets a fresh mock.
#[derive(Clone, Default)]
pub struct MockPortOpener {
    ports: Arc<Mutex<HashMap<String, MockSerialPort>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    opened: Arc<Mutex<Vec<String>>>,
}

impl MockPortOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the device returned for `path`.
    pub fn insert(&self, path: impl Into<String>, port: MockSerialPort) {
        self.ports.lock().insert(path.into(), port);
    }

    /// Make every open of `path` fail as if the device did not exist.
    pub fn fail_path(&self, path: impl Into<String>) {
        self.failing.lock().insert(path.into());
    }

    /// Paths passed to `open`, in call order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl PortOpener for MockPortOpener {
    fn open(
        &self,
        path: &str,
        _config: &PortConfiguration,
    ) -> Result<Box<dyn SerialPortAdapter>, PortError> {
        self.opened.lock().push(path.to_string());
        if self.failing.lock().contains(path) {
            return Err(PortError::not_found(path));
        }

        let port = self
            .ports
            .lock()
            .entry(path.to_string())
            .or_insert_with(|| MockSerialPort::new(path))
            .clone();
        port.reopen();
        Ok(Box::new(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_and_read() {
        let mut port = MockSerialPort::new("MOCK0");
        port.enqueue_read(b"Hello");

        assert_eq!(port.bytes_to_read().unwrap(), 5);
        let mut buffer = [0u8; 10];
        let n = port.read_bytes(&mut buffer).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buffer[..n], b"Hello");
    }

    #[test]
    fn test_write_logging() {
        let mut port = MockSerialPort::new("MOCK0");
        port.write_bytes(b"Test1").unwrap();
        port.write_bytes(b"Test2").unwrap();

        let log = port.get_write_log();
        assert_eq!(log, vec![b"Test1".to_vec(), b"Test2".to_vec()]);
    }

    #[test]
    fn test_delayed_response() {
        let mut port = MockSerialPort::new("MOCK0");
        port.set_responder(|_| Some(vec![0xAA]));
        port.set_response_delay(Duration::from_millis(30));

        port.write_bytes(b"x").unwrap();
        assert_eq!(port.bytes_to_read().unwrap(), 0);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(port.bytes_to_read().unwrap(), 1);
    }

    #[test]
    fn test_clear_input_drops_pending_bytes() {
        let mut port = MockSerialPort::new("MOCK0");
        port.enqueue_read(b"stale");
        port.clear_input().unwrap();
        assert_eq!(port.bytes_to_read().unwrap(), 0);
    }

    #[test]
    fn test_read_fault_is_one_shot() {
        let port = MockSerialPort::new("MOCK0");
        port.fail_next_read("gone");
        assert!(matches!(port.bytes_to_read(), Err(PortError::Io(_))));
        assert_eq!(port.bytes_to_read().unwrap(), 0);
    }

    #[test]
    fn test_short_write() {
        let mut port = MockSerialPort::new("MOCK0");
        port.set_short_writes(true);
        assert_eq!(port.write_bytes(b"abcd").unwrap(), 3);
    }

    #[test]
    fn test_close_and_reopen_through_opener() {
        let opener = MockPortOpener::new();
        let device = MockSerialPort::new("/dev/mock0");
        opener.insert("/dev/mock0", device.clone());

        let mut port = opener
            .open("/dev/mock0", &PortConfiguration::default())
            .unwrap();
        port.close();
        assert!(!device.is_open());
        assert_eq!(device.close_count(), 1);

        let port = opener
            .open("/dev/mock0", &PortConfiguration::default())
            .unwrap();
        assert!(port.is_open());
        assert_eq!(opener.opened(), vec!["/dev/mock0", "/dev/mock0"]);
    }

    #[test]
    fn test_opener_failure() {
        let opener = MockPortOpener::new();
        opener.fail_path("/dev/missing");
        let err = opener
            .open("/dev/missing", &PortConfiguration::default())
            .unwrap_err();
        assert!(matches!(err, PortError::NotFound(_)));
    }
}
