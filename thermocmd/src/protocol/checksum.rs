//! Checksum primitives for frame integrity.
//!
//! Command frames carry a 16-bit checksum (CRC-16/XMODEM, poly 0x1021,
//! init 0x0000); fixed-size telemetry info lines carry an 8-bit checksum
//! (CRC-8, poly 0x07, init 0x00). Both detect any single-bit flip
//! deterministically.

/// Compute the 16-bit checksum used by command frames (CRC-16/XMODEM).
#[must_use]
pub fn checksum16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Compute the 8-bit checksum used by telemetry info lines (CRC-8).
///
/// Never used for command frames; those always carry [`checksum16`].
#[must_use]
pub fn checksum8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0x00;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
