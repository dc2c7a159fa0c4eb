//! # thermocmd
//!
//! Command/response protocol core for thermal-imaging sensor modules.
//!
//! This crate frames commands, drives them to completion over a pluggable
//! transport, and orchestrates firmware downloads:
//!
//! - Checksummed command framing (CRC16-XMODEM) with partial-frame reassembly
//! - A blocking command engine with bounded status polling
//! - Firmware/bootloader download with chunking, retries, cancellation and
//!   post-transfer verification
//! - Device lifecycle status tracking per channel
//!
//! ## Transports
//!
//! All device I/O goes through the [`Transport`] trait. The crate ships one
//! backend, [`SerialTransport`] (the `native` feature, on by default);
//! embedding applications provide their own for I2C, USB, SPI or V4L2-style
//! nodes.
//!
//! ## Features
//!
//! - `native` (default): serial transport via the `serialport` crate
//! - `serde`: serialization support for protocol data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use thermocmd::{
//!     CommandChannel, NodeDescriptor, Opcode, UpgradeKind, UpgradeSession,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         use thermocmd::{InitParams, SerialTransport, Transport};
//!
//!         let descriptor = NodeDescriptor::parse("UART:/dev/ttyUSB0;")?;
//!         let mut transport = SerialTransport::new();
//!         transport.open(&descriptor)?;
//!         transport.initialize(&InitParams::Serial {
//!             baud_rate: 115_200,
//!             timeout_ms: 1000,
//!         })?;
//!
//!         let mut channel = CommandChannel::new(Box::new(transport));
//!
//!         // Any vendor opcode works; the engine does not interpret payloads.
//!         let version = channel.query(Opcode(0x0102), &[])?;
//!         println!("firmware version bytes: {version:02X?}");
//!
//!         let image = std::fs::read("firmware.bin")?;
//!         let mut sink = |e: &thermocmd::ProgressEvent| {
//!             println!("download: {}%", e.percent);
//!         };
//!         UpgradeSession::new(&mut channel, UpgradeKind::Firmware)
//!             .on_progress(&mut sink)
//!             .run(&image)?;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod protocol;
pub mod status;
pub mod transport;
pub mod upgrade;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use transport::serial::SerialTransport;
pub use {
    channel::{ChannelConfig, ChannelEvent, CommandChannel, EventCallback},
    error::{Error, FramingError, Result, TransportError},
    protocol::frame::{CommandFrame, Direction, Opcode},
    status::{DeviceStatus, StatusManager},
    transport::{
        ChannelKind, DeviceMode, InitParams, IoParam, NodeDescriptor, Transport, TransportState,
    },
    upgrade::{CancelToken, ProgressEvent, UpgradeKind, UpgradeOptions, UpgradeSession},
};
