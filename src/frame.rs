//! Servo bus frame encoding and validation.
//!
//! Frames on the bus look like
//!
//! ```text
//! FF FF | id | len | status/instr | params... | checksum
//! ```
//!
//! where `checksum = !(id + len + status + params...) & 0xFF`, i.e. the
//! one's-complement of the byte sum between the header and the checksum.
//! `validate` works on replies; `encode` builds the requests the poll jobs
//! need. Nothing in here knows about ports or sessions.

use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Two-byte sentinel that starts every frame.
pub const HEADER: [u8; 2] = [0xFF, 0xFF];

/// header(2) + id + len + status + checksum
pub const MIN_FRAME_LEN: usize = 6;

const ID_OFFSET: usize = 2;
const STATUS_OFFSET: usize = 4;
const PAYLOAD_OFFSET: usize = 5;

/// Outcome of validating a reply frame.
///
/// The device reports its faults as single bits of the status byte; the last
/// two codes are produced locally when a frame cannot be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoError,
    /// Bit 6: undefined instruction or ACTION without REG_WRITE.
    InstructionError,
    /// Bit 5: load exceeds the configured max torque.
    Overload,
    /// Bit 4: the device rejected our checksum, or we rejected its.
    ChecksumError,
    /// Bit 3: instruction parameter out of range.
    OutOfRange,
    /// Bit 2: internal temperature above the limit.
    Overheat,
    /// Bit 1: goal position outside the angle limits.
    AngleOutOfRange,
    /// Bit 0: supply voltage outside the configured window.
    VoltageOutOfRange,
    /// Frame shorter than the minimum frame size.
    InvalidLength,
    /// Frame was valid but the payload did not parse.
    InvalidData,
}

/// Device status bits in priority order.
const STATUS_BITS: [(u8, ErrorCode); 7] = [
    (1 << 6, ErrorCode::InstructionError),
    (1 << 5, ErrorCode::Overload),
    (1 << 4, ErrorCode::ChecksumError),
    (1 << 3, ErrorCode::OutOfRange),
    (1 << 2, ErrorCode::Overheat),
    (1 << 1, ErrorCode::AngleOutOfRange),
    (1 << 0, ErrorCode::VoltageOutOfRange),
];

impl ErrorCode {
    /// Numeric value; device codes match their status bit.
    pub fn code(self) -> u16 {
        match self {
            Self::NoError => 0,
            Self::InstructionError => 1 << 6,
            Self::Overload => 1 << 5,
            Self::ChecksumError => 1 << 4,
            Self::OutOfRange => 1 << 3,
            Self::Overheat => 1 << 2,
            Self::AngleOutOfRange => 1 << 1,
            Self::VoltageOutOfRange => 1 << 0,
            Self::InvalidLength => 1 << 7,
            Self::InvalidData => 1 << 8,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::NoError => "No error",
            Self::InstructionError => "Instruction error",
            Self::Overload => "Overload",
            Self::ChecksumError => "Checksum error",
            Self::OutOfRange => "Out of range",
            Self::Overheat => "Overheat",
            Self::AngleOutOfRange => "Out of angle range",
            Self::VoltageOutOfRange => "Over voltage or under voltage",
            Self::InvalidLength => "Invalid packet length",
            Self::InvalidData => "Invalid data",
        }
    }

    /// Map a non-zero status byte to its highest-priority fault.
    ///
    /// Bit 7 is not defined by the device; a status carrying only that bit
    /// is reported as an instruction error.
    pub fn from_status(status: u8) -> Self {
        if status == 0 {
            return Self::NoError;
        }
        STATUS_BITS
            .iter()
            .find(|(bit, _)| status & bit != 0)
            .map(|(_, code)| *code)
            .unwrap_or(Self::InstructionError)
    }

    pub fn is_ok(self) -> bool {
        self == Self::NoError
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Instruction byte of a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Instruction {
    Ping = 0x01,
    ReadData = 0x02,
    WriteData = 0x03,
    RegWrite = 0x04,
    Action = 0x05,
    Reset = 0x06,
    SyncWrite = 0x83,
}

/// One's-complement of the byte sum, truncated to a byte.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    !sum
}

/// Validate a reply frame and borrow its payload.
///
/// Returns `(NoError, Some(payload))` for a good frame, where the payload is
/// everything between the status byte and the checksum. Any other code comes
/// with `None`: a frame that fails the length or checksum test, or carries a
/// device fault, is never partially trusted.
pub fn validate(buffer: &[u8]) -> (ErrorCode, Option<&[u8]>) {
    if buffer.len() < MIN_FRAME_LEN {
        debug!(len = buffer.len(), "frame too short, discarding");
        return (ErrorCode::InvalidLength, None);
    }

    let last = buffer.len() - 1;
    let expected = checksum(&buffer[ID_OFFSET..last]);
    if expected != buffer[last] {
        debug!(
            expected = expected,
            actual = buffer[last],
            frame = %to_hex(buffer),
            "checksum mismatch, discarding frame"
        );
        return (ErrorCode::ChecksumError, None);
    }

    let status = buffer[STATUS_OFFSET];
    if status != 0 {
        let code = ErrorCode::from_status(status);
        warn!(device_id = buffer[ID_OFFSET], status = status, "device reported {}", code);
        return (code, None);
    }

    (ErrorCode::NoError, Some(&buffer[PAYLOAD_OFFSET..last]))
}

/// `validate` in `Result` form, for call sites that want `?`.
pub fn payload(buffer: &[u8]) -> Result<&[u8], ErrorCode> {
    match validate(buffer) {
        (ErrorCode::NoError, Some(payload)) => Ok(payload),
        (code, _) => Err(code),
    }
}

/// Device id a reply is addressed from, if the frame is long enough.
pub fn device_id(buffer: &[u8]) -> Option<u8> {
    (buffer.len() >= MIN_FRAME_LEN).then(|| buffer[ID_OFFSET])
}

/// Largest parameter block whose length still fits the one-byte length field.
pub const MAX_PARAMS: usize = u8::MAX as usize - 2;

/// Build a request frame.
///
/// `params` includes the register address for the instructions that take
/// one. The length byte counts the instruction, the params and the checksum.
///
/// Fails with `ErrorCode::InvalidLength` if `params` is longer than
/// [`MAX_PARAMS`].
pub fn encode(id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>, ErrorCode> {
    let length = u8::try_from(params.len() + 2).map_err(|_| ErrorCode::InvalidLength)?;
    let mut frame = Vec::with_capacity(params.len() + MIN_FRAME_LEN);
    frame.extend_from_slice(&HEADER);
    frame.push(id);
    frame.push(length);
    frame.push(instruction as u8);
    frame.extend_from_slice(params);
    frame.push(checksum(&frame[ID_OFFSET..]));
    Ok(frame)
}

/// READ_DATA request for `length` registers starting at `address`.
pub fn read_request(id: u8, address: u8, length: u8) -> Vec<u8> {
    let params = [address, length];
    let mut frame = Vec::with_capacity(params.len() + MIN_FRAME_LEN);
    frame.extend_from_slice(&HEADER);
    frame.extend_from_slice(&[id, 4, Instruction::ReadData as u8]);
    frame.extend_from_slice(&params);
    frame.push(checksum(&frame[ID_OFFSET..]));
    frame
}

/// Render bytes as space-separated upper-case hex, for logs.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    /// Reply frame with a correct checksum.
    fn reply(id: u8, status: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xFF, id, (payload.len() + 2) as u8, status];
        frame.extend_from_slice(payload);
        frame.push(checksum(&frame[2..]));
        frame
    }

    #[test]
    fn test_example_frame() {
        let frame = [0xFF, 0xFF, 0x01, 0x03, 0x00, 0x0A, 0xF1];
        assert_eq!(validate(&frame), (ErrorCode::NoError, Some(&[0x0A][..])));
    }

    #[test]
    fn test_short_buffers_are_invalid_length() {
        for len in 0..MIN_FRAME_LEN {
            let buffer = vec![0xFF; len];
            assert_eq!(validate(&buffer), (ErrorCode::InvalidLength, None));
        }
    }

    #[test]
    fn test_minimum_frame_has_empty_payload() {
        let frame = reply(7, 0, &[]);
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        assert_eq!(validate(&frame), (ErrorCode::NoError, Some(&[][..])));
    }

    #[test]
    fn test_status_byte_maps_to_fault() {
        let frame = reply(1, 1 << 2, &[0x10]);
        assert_eq!(validate(&frame), (ErrorCode::Overheat, None));

        // Overload and voltage together: the higher bit wins.
        let frame = reply(1, (1 << 5) | 1, &[]);
        assert_eq!(validate(&frame), (ErrorCode::Overload, None));
    }

    #[test]
    fn test_from_status_covers_every_bit() {
        for (bit, code) in STATUS_BITS {
            assert_eq!(ErrorCode::from_status(bit), code);
            assert_eq!(code.code(), bit as u16);
        }
        assert_eq!(ErrorCode::from_status(0), ErrorCode::NoError);
        assert_eq!(ErrorCode::from_status(0x80), ErrorCode::InstructionError);
    }

    #[test]
    fn test_encode_read_request() {
        // Read the present position (2 bytes at 0x24) from servo 1.
        let frame = read_request(1, 0x24, 2);
        assert_eq!(frame, vec![0xFF, 0xFF, 0x01, 0x04, 0x02, 0x24, 0x02, 0xD2]);
    }

    #[test]
    fn test_encode_ping() {
        assert_eq!(
            encode(1, Instruction::Ping, &[]),
            Ok(vec![0xFF, 0xFF, 0x01, 0x02, 0x01, 0xFB])
        );
    }

    #[test]
    fn test_encode_rejects_params_past_length_byte() {
        let widest = encode(3, Instruction::SyncWrite, &[0xAA; MAX_PARAMS]).unwrap();
        assert_eq!(widest[3], 0xFF);
        assert_eq!(widest.len(), MAX_PARAMS + MIN_FRAME_LEN);
        assert_eq!(
            encode(3, Instruction::SyncWrite, &[0xAA; MAX_PARAMS + 1]),
            Err(ErrorCode::InvalidLength)
        );
    }

    #[test]
    fn test_read_request_matches_encode() {
        assert_eq!(
            Ok(read_request(7, 0x18, 25)),
            encode(7, Instruction::ReadData, &[0x18, 25])
        );
    }

    #[test]
    fn test_payload_result_form() {
        assert_eq!(payload(&reply(2, 0, &[1, 2])), Ok(&[1u8, 2][..]));
        assert_eq!(payload(&[0xFF]), Err(ErrorCode::InvalidLength));
        assert_eq!(device_id(&reply(9, 0, &[])), Some(9));
        assert_eq!(device_id(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_display_and_hex() {
        assert_eq!(ErrorCode::ChecksumError.to_string(), "Checksum error (16)");
        assert_eq!(to_hex(&[0xFF, 0x01, 0x0A]), "FF 01 0A");
    }

    proptest! {
        #[test]
        fn prop_checksum_round_trip(
            id in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let frame = reply(id, 0, &payload);
            prop_assert_eq!(validate(&frame), (ErrorCode::NoError, Some(&payload[..])));
        }

        #[test]
        fn prop_single_byte_corruption_is_detected(
            payload in proptest::collection::vec(any::<u8>(), 1..32),
            index in any::<proptest::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut frame = reply(1, 0, &payload);
            // Any byte covered by the checksum, or the checksum itself.
            let pos = 2 + index.index(frame.len() - 2);
            frame[pos] ^= flip;
            prop_assert_eq!(validate(&frame), (ErrorCode::ChecksumError, None));
        }
    }
}
