//! Shared test utilities for the integration tests.
//!
//! `ServoBus` simulates daisy-chained servos behind a `MockSerialPort`: each
//! device has a register file and answers PING, READ_DATA and WRITE_DATA the
//! way real hardware does.

#![allow(dead_code)]

use parking_lot::Mutex;
use servo_serial_hub::config::Config;
use servo_serial_hub::frame::{self, Instruction};
use servo_serial_hub::port::{MockPortOpener, MockSerialPort};
use servo_serial_hub::HubService;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const REGISTER_COUNT: usize = 0x31;

/// Register files of the simulated devices, by id.
#[derive(Clone, Default)]
pub struct ServoBus {
    devices: Arc<Mutex<HashMap<u8, [u8; REGISTER_COUNT]>>>,
}

impl ServoBus {
    pub fn new(ids: &[u8]) -> Self {
        let bus = Self::default();
        for &id in ids {
            let mut registers = [0u8; REGISTER_COUNT];
            registers[0x00] = 0x0C; // model number L
            registers[0x03] = id;
            registers[0x2B] = 35; // temperature
            bus.devices.lock().insert(id, registers);
        }
        bus
    }

    pub fn set_register(&self, id: u8, address: u8, value: u8) {
        if let Some(registers) = self.devices.lock().get_mut(&id) {
            registers[usize::from(address)] = value;
        }
    }

    pub fn register(&self, id: u8, address: u8) -> Option<u8> {
        self.devices
            .lock()
            .get(&id)
            .map(|registers| registers[usize::from(address)])
    }

    /// The reply a device on this bus sends to `request`, if any.
    pub fn answer(&self, request: &[u8]) -> Option<Vec<u8>> {
        // A corrupted request gets no reply at all.
        if request.len() < frame::MIN_FRAME_LEN
            || frame::checksum(&request[2..request.len() - 1]) != request[request.len() - 1]
        {
            return None;
        }
        let id = request[2];
        let params = &request[5..request.len() - 1];
        let mut devices = self.devices.lock();
        let registers = devices.get_mut(&id)?;

        let payload = match request[4] {
            x if x == Instruction::Ping as u8 => Vec::new(),
            x if x == Instruction::ReadData as u8 => {
                let start = usize::from(*params.first()?);
                let end = start + usize::from(*params.get(1)?);
                registers.get(start..end)?.to_vec()
            }
            x if x == Instruction::WriteData as u8 => {
                let start = usize::from(*params.first()?);
                let data = &params[1..];
                registers.get_mut(start..start + data.len())?.copy_from_slice(data);
                Vec::new()
            }
            _ => return Some(status_frame(id, 1 << 6, &[])),
        };
        Some(status_frame(id, 0, &payload))
    }

    /// Attach this bus to `device` as its responder.
    pub fn attach(&self, device: &MockSerialPort) {
        let bus = self.clone();
        device.set_responder(move |request| bus.answer(request));
    }
}

/// A reply frame with a correct checksum.
pub fn status_frame(id: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let mut reply = vec![0xFF, 0xFF, id, (payload.len() + 2) as u8, status];
    reply.extend_from_slice(payload);
    reply.push(frame::checksum(&reply[2..]));
    reply
}

/// A config with short timeouts so failure paths finish quickly.
pub fn fast_config(response_timeout: Duration) -> Config {
    let mut config = Config::default();
    config.serial.response_timeout_ms = response_timeout.as_millis() as u64;
    config.serial.read_poll_interval_ms = 2;
    config.poll.default_interval_ms = 20;
    config
}

/// A hub whose ports are the given mock devices.
pub fn hub_with_devices(devices: &[(&str, &MockSerialPort)], config: Config) -> HubService {
    let opener = MockPortOpener::new();
    for (path, device) in devices {
        opener.insert(*path, (*device).clone());
    }
    HubService::new(Arc::new(opener), config)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
