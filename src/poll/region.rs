//! Telemetry regions read by poll jobs.
//!
//! A region is one `READ_DATA` request over a contiguous register block and
//! a parser that turns the reply payload into a typed record.

use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;

use crate::frame::{self, ErrorCode};

/// Which block a telemetry record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    Eeprom,
    Ram,
}

/// A request/parse pair for one register block.
pub trait TelemetryRegion: Send + Sync + Debug {
    fn kind(&self) -> TelemetryKind;

    /// The request frame sent to `device_id` on every poll iteration.
    fn build_request(&self, device_id: u8) -> Vec<u8>;

    /// Parse a validated reply payload.
    fn parse(&self, payload: &[u8]) -> Result<TelemetryRecord, ErrorCode>;
}

/// Parsed contents of a telemetry region.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryRecord {
    Eeprom(EepromData),
    Ram(RamData),
}

impl TelemetryRecord {
    pub fn kind(&self) -> TelemetryKind {
        match self {
            Self::Eeprom(_) => TelemetryKind::Eeprom,
            Self::Ram(_) => TelemetryKind::Ram,
        }
    }
}

/// Persistent configuration registers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EepromData {
    pub model_number: u16,
    pub version: u8,
    pub id: u8,
    pub baud_rate: u8,
    pub return_delay_time: u8,
    /// Degrees.
    pub cw_angle_limit: f32,
    /// Degrees.
    pub ccw_angle_limit: f32,
    pub max_temperature: u8,
    pub min_voltage: u8,
    pub max_voltage: u8,
    pub max_torque: u16,
    pub status_return_level: u8,
    pub alarm_led: u8,
    pub alarm_shutdown: u8,
}

/// Volatile control and status registers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RamData {
    pub torque_enable: u8,
    pub led: u8,
    pub cw_compliance_margin: u8,
    pub ccw_compliance_margin: u8,
    pub cw_compliance_slope: u8,
    pub ccw_compliance_slope: u8,
    /// Degrees.
    pub goal_position: f32,
    /// RPM.
    pub moving_speed: f32,
    pub acceleration: u8,
    pub deceleration: u8,
    /// Degrees.
    pub present_position: f32,
    /// RPM.
    pub present_speed: f32,
    pub present_load: u16,
    pub present_voltage: u8,
    pub temperature: u8,
    pub reg_write: u8,
    pub moving: u8,
    pub lock: u8,
    pub min_pwm: u16,
}

/// Register addresses of the EEPROM block.
pub mod eeprom {
    pub const MODEL_NUMBER_L: u8 = 0x00;
    pub const VERSION: u8 = 0x02;
    pub const ID: u8 = 0x03;
    pub const BAUD_RATE: u8 = 0x04;
    pub const RETURN_DELAY_TIME: u8 = 0x05;
    pub const CW_ANGLE_LIMIT_L: u8 = 0x06;
    pub const CCW_ANGLE_LIMIT_L: u8 = 0x08;
    pub const MAX_TEMPERATURE: u8 = 0x0B;
    pub const MIN_VOLTAGE: u8 = 0x0C;
    pub const MAX_VOLTAGE: u8 = 0x0D;
    pub const MAX_TORQUE_L: u8 = 0x0E;
    pub const STATUS_RETURN_LEVEL: u8 = 0x10;
    pub const ALARM_LED: u8 = 0x11;
    pub const ALARM_SHUTDOWN: u8 = 0x12;

    pub const FIRST: u8 = MODEL_NUMBER_L;
    pub const LAST: u8 = ALARM_SHUTDOWN;
}

/// Register addresses of the RAM block.
pub mod ram {
    pub const TORQUE_ENABLE: u8 = 0x18;
    pub const LED: u8 = 0x19;
    pub const CW_COMPLIANCE_MARGIN: u8 = 0x1A;
    pub const CCW_COMPLIANCE_MARGIN: u8 = 0x1B;
    pub const CW_COMPLIANCE_SLOPE: u8 = 0x1C;
    pub const CCW_COMPLIANCE_SLOPE: u8 = 0x1D;
    pub const GOAL_POSITION_L: u8 = 0x1E;
    pub const MOVING_SPEED_L: u8 = 0x20;
    pub const ACCELERATION: u8 = 0x22;
    pub const DECELERATION: u8 = 0x23;
    pub const PRESENT_POSITION_L: u8 = 0x24;
    pub const PRESENT_SPEED_L: u8 = 0x26;
    pub const PRESENT_LOAD_L: u8 = 0x28;
    pub const PRESENT_VOLTAGE: u8 = 0x2A;
    pub const TEMPERATURE: u8 = 0x2B;
    pub const REG_WRITE: u8 = 0x2C;
    pub const MOVING: u8 = 0x2D;
    pub const LOCK: u8 = 0x2E;
    pub const MIN_PWM_L: u8 = 0x2F;

    pub const FIRST: u8 = TORQUE_ENABLE;
    pub const LAST: u8 = MIN_PWM_L + 1;
}

/// Raw position units to degrees.
pub fn position_degrees(raw: u16) -> f32 {
    raw as f32 * 300.0 / 1023.0
}

/// Raw speed units to RPM.
pub fn speed_rpm(raw: u16) -> f32 {
    raw as f32 * 62.0 / 1023.0
}

/// A payload addressed by register number.
struct Registers<'a> {
    first: u8,
    data: &'a [u8],
}

impl<'a> Registers<'a> {
    fn new(first: u8, last: u8, data: &'a [u8]) -> Result<Self, ErrorCode> {
        let needed = usize::from(last - first) + 1;
        if data.len() < needed {
            return Err(ErrorCode::InvalidData);
        }
        Ok(Self { first, data })
    }

    fn byte(&self, address: u8) -> u8 {
        self.data[usize::from(address - self.first)]
    }

    /// Little-endian pair starting at `low`.
    fn word(&self, low: u8) -> u16 {
        u16::from_le_bytes([self.byte(low), self.byte(low + 1)])
    }
}

fn block_length(first: u8, last: u8) -> u8 {
    last - first + 1
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EepromRegion;

impl TelemetryRegion for EepromRegion {
    fn kind(&self) -> TelemetryKind {
        TelemetryKind::Eeprom
    }

    fn build_request(&self, device_id: u8) -> Vec<u8> {
        frame::read_request(
            device_id,
            eeprom::FIRST,
            block_length(eeprom::FIRST, eeprom::LAST),
        )
    }

    fn parse(&self, payload: &[u8]) -> Result<TelemetryRecord, ErrorCode> {
        use eeprom::*;
        let r = Registers::new(FIRST, LAST, payload)?;
        Ok(TelemetryRecord::Eeprom(EepromData {
            model_number: r.word(MODEL_NUMBER_L),
            version: r.byte(VERSION),
            id: r.byte(ID),
            baud_rate: r.byte(BAUD_RATE),
            return_delay_time: r.byte(RETURN_DELAY_TIME),
            cw_angle_limit: position_degrees(r.word(CW_ANGLE_LIMIT_L)),
            ccw_angle_limit: position_degrees(r.word(CCW_ANGLE_LIMIT_L)),
            max_temperature: r.byte(MAX_TEMPERATURE),
            min_voltage: r.byte(MIN_VOLTAGE),
            max_voltage: r.byte(MAX_VOLTAGE),
            max_torque: r.word(MAX_TORQUE_L),
            status_return_level: r.byte(STATUS_RETURN_LEVEL),
            alarm_led: r.byte(ALARM_LED),
            alarm_shutdown: r.byte(ALARM_SHUTDOWN),
        }))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RamRegion;

impl TelemetryRegion for RamRegion {
    fn kind(&self) -> TelemetryKind {
        TelemetryKind::Ram
    }

    fn build_request(&self, device_id: u8) -> Vec<u8> {
        frame::read_request(device_id, ram::FIRST, block_length(ram::FIRST, ram::LAST))
    }

    fn parse(&self, payload: &[u8]) -> Result<TelemetryRecord, ErrorCode> {
        use ram::*;
        let r = Registers::new(FIRST, LAST, payload)?;
        Ok(TelemetryRecord::Ram(RamData {
            torque_enable: r.byte(TORQUE_ENABLE),
            led: r.byte(LED),
            cw_compliance_margin: r.byte(CW_COMPLIANCE_MARGIN),
            ccw_compliance_margin: r.byte(CCW_COMPLIANCE_MARGIN),
            cw_compliance_slope: r.byte(CW_COMPLIANCE_SLOPE),
            ccw_compliance_slope: r.byte(CCW_COMPLIANCE_SLOPE),
            goal_position: position_degrees(r.word(GOAL_POSITION_L)),
            moving_speed: speed_rpm(r.word(MOVING_SPEED_L)),
            acceleration: r.byte(ACCELERATION),
            deceleration: r.byte(DECELERATION),
            present_position: position_degrees(r.word(PRESENT_POSITION_L)),
            present_speed: speed_rpm(r.word(PRESENT_SPEED_L)),
            present_load: r.word(PRESENT_LOAD_L),
            present_voltage: r.byte(PRESENT_VOLTAGE),
            temperature: r.byte(TEMPERATURE),
            reg_write: r.byte(REG_WRITE),
            moving: r.byte(MOVING),
            lock: r.byte(LOCK),
            min_pwm: r.word(MIN_PWM_L),
        }))
    }
}

/// The EEPROM and RAM regions, in that order.
pub fn default_regions() -> Vec<Arc<dyn TelemetryRegion>> {
    vec![Arc::new(EepromRegion), Arc::new(RamRegion)]
}
