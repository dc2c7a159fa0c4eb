//! Command frame encoding and decoding.
//!
//! Pure functions, no I/O. Every command and response exchanged with the
//! module uses the same frame layout (all fields little-endian):
//!
//! ```text
//! +--------+--------+---------------+--------+
//! | Opcode | Length |    Payload    | CRC16  |
//! +--------+--------+---------------+--------+
//! | 2 bytes| 4 bytes|  0..N bytes   | 2 bytes|
//! +--------+--------+---------------+--------+
//! |  cmd   | total  |    data       | CRC    |
//! +--------+--------+---------------+--------+
//! ```
//!
//! `Length` covers the whole frame including the trailing CRC; the CRC is
//! computed over opcode + length + payload. The checksum is always
//! recomputed on encode and re-validated on decode, never trusted across a
//! transport boundary.
//!
//! Auxiliary telemetry info lines use a different, fixed-size layout: a
//! 64-byte block of 63 data bytes terminated by an 8-bit checksum.

use crate::error::FramingError;
use crate::protocol::checksum::{checksum8, checksum16};
use byteorder::{LittleEndian, WriteBytesExt};

/// Frame overhead: opcode (2) + length (4) + CRC16 (2).
pub const FRAME_OVERHEAD: usize = 8;

/// Header length: opcode (2) + length (4).
const HEADER_LEN: usize = 6;

/// Maximum command/response payload (firmware log and image dumps).
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Payload bound for register-style commands on constrained transports.
pub const REGISTER_PAYLOAD_LIMIT: usize = 64;

/// Telemetry info line size: 63 data bytes + 1 checksum byte.
pub const INFO_LINE_LEN: usize = 64;

/// Response status byte: command executed successfully.
pub const STATUS_OK: u8 = 0x00;

/// Response status byte: command still executing, keep polling.
pub const STATUS_BUSY: u8 = 0x01;

/// Command identifier.
///
/// The engine does not interpret payload meaning; opcodes are caller-chosen.
/// The constants below are the ones this crate itself dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Opcode(pub u16);

impl Opcode {
    /// Probe whether the unit runs ROM or cached application code.
    pub const DEVICE_MODE: Opcode = Opcode(0x0101);
    /// Query current device lifecycle status.
    pub const DEVICE_STATUS: Opcode = Opcode(0x0104);
    /// Write one firmware image chunk.
    pub const FIRMWARE_CHUNK: Opcode = Opcode(0x0D02);
    /// Write one bootloader image chunk.
    pub const BOOTLOADER_CHUNK: Opcode = Opcode(0x0D03);
    /// Read back the device-computed checksum of a downloaded image.
    pub const UPGRADE_VERIFY: Opcode = Opcode(0x0D04);
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Host-side direction of a command exchange.
///
/// Not encoded on the wire; it selects which transport operation carries the
/// frame and whether a status read follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Query: write the command, poll for a status frame carrying data.
    Read,
    /// Write: write the command, poll for a bare status frame.
    #[default]
    Write,
    /// Fire-and-forget write: no status read follows.
    ///
    /// Only the write itself is confirmed, never the device-side effect.
    WriteNoStatus,
}

/// One encoded request or response unit exchanged with the device.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    /// Command identifier.
    pub opcode: Opcode,
    /// Host-side routing direction (not on the wire).
    pub direction: Direction,
    /// Command payload bytes.
    pub payload: Vec<u8>,
    /// CRC-16 over opcode + length + payload, recomputed on encode.
    pub checksum: u16,
}

// Direction is host-side metadata; two frames are equal when their wire
// content is equal.
impl PartialEq for CommandFrame {
    fn eq(&self, other: &Self) -> bool {
        self.opcode == other.opcode
            && self.payload == other.payload
            && self.checksum == other.checksum
    }
}

impl Eq for CommandFrame {}

impl CommandFrame {
    /// Total wire length of this frame in bytes.
    pub fn wire_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Set the host-side direction.
    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Serialize the frame into wire bytes.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let total_len = self.wire_len();
        let mut buf = Vec::with_capacity(total_len);

        buf.write_u16::<LittleEndian>(self.opcode.0).unwrap();
        // Safe cast: MAX_PAYLOAD keeps frames far below u32::MAX
        buf.write_u32::<LittleEndian>(total_len as u32).unwrap();
        buf.extend_from_slice(&self.payload);

        let crc = checksum16(&buf);
        buf.write_u16::<LittleEndian>(crc).unwrap();

        buf
    }
}

/// Build a command frame from an opcode and payload, computing the checksum.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn encode(opcode: Opcode, payload: &[u8]) -> CommandFrame {
    let total_len = FRAME_OVERHEAD + payload.len();
    let mut covered = Vec::with_capacity(HEADER_LEN + payload.len());
    covered.extend_from_slice(&opcode.0.to_le_bytes());
    covered.extend_from_slice(&(total_len as u32).to_le_bytes());
    covered.extend_from_slice(payload);

    CommandFrame {
        opcode,
        direction: Direction::default(),
        payload: payload.to_vec(),
        checksum: checksum16(&covered),
    }
}

/// Parse and validate a frame from received bytes.
///
/// Never mutates its input. Fails with [`FramingError::Truncated`] while
/// fewer bytes are available than the frame's declared length, which lets
/// callers buffer partial frames and retry once more data arrives.
pub fn decode(bytes: &[u8]) -> Result<CommandFrame, FramingError> {
    if bytes.len() < HEADER_LEN {
        return Err(FramingError::Truncated {
            needed: FRAME_OVERHEAD,
            available: bytes.len(),
        });
    }

    let opcode = Opcode(u16::from_le_bytes([bytes[0], bytes[1]]));
    let declared = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;

    if declared < FRAME_OVERHEAD {
        return Err(FramingError::Truncated {
            needed: FRAME_OVERHEAD,
            available: declared,
        });
    }
    if declared > FRAME_OVERHEAD + MAX_PAYLOAD {
        return Err(FramingError::PayloadTooLarge {
            len: declared - FRAME_OVERHEAD,
            max: MAX_PAYLOAD,
        });
    }
    if bytes.len() < declared {
        return Err(FramingError::Truncated {
            needed: declared,
            available: bytes.len(),
        });
    }

    let frame = &bytes[..declared];
    let body = &frame[..declared - 2];
    let expected = checksum16(body);
    let actual = u16::from_le_bytes([frame[declared - 2], frame[declared - 1]]);
    if expected != actual {
        return Err(FramingError::ChecksumMismatch { expected, actual });
    }

    Ok(CommandFrame {
        opcode,
        direction: Direction::default(),
        payload: frame[HEADER_LEN..declared - 2].to_vec(),
        checksum: actual,
    })
}

/// Build a 64-byte telemetry info line from 63 data bytes.
#[must_use]
pub fn encode_info_line(data: &[u8; INFO_LINE_LEN - 1]) -> [u8; INFO_LINE_LEN] {
    let mut line = [0u8; INFO_LINE_LEN];
    line[..INFO_LINE_LEN - 1].copy_from_slice(data);
    line[INFO_LINE_LEN - 1] = checksum8(data);
    line
}

/// Validate a fixed-size telemetry info line and return its data bytes.
pub fn decode_info_line(block: &[u8]) -> Result<&[u8], FramingError> {
    if block.len() < INFO_LINE_LEN {
        return Err(FramingError::Truncated {
            needed: INFO_LINE_LEN,
            available: block.len(),
        });
    }
    let data = &block[..INFO_LINE_LEN - 1];
    let expected = checksum8(data);
    let actual = block[INFO_LINE_LEN - 1];
    if expected != actual {
        return Err(FramingError::ChecksumMismatch {
            expected: u16::from(expected),
            actual: u16::from(actual),
        });
    }
    Ok(data)
}
