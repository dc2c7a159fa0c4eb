//! Framing and integrity layer.

pub mod checksum;
pub mod frame;

// Re-export common types
pub use checksum::{checksum8, checksum16};
pub use frame::{CommandFrame, Direction, Opcode, decode, decode_info_line, encode, encode_info_line};
