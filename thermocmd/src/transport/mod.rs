//! Transport abstraction for command channels.
//!
//! This module defines the capability contract every backend implements:
//!
//! - **Serial** (UART): reference implementation in [`serial`] (native)
//! - **I2C**, **USB control**, **USB bulk-I2C**, **SPI**, **video node**:
//!   provided by embedding applications that own the platform I/O
//!
//! The design separates raw I/O from protocol logic: the command engine and
//! the download orchestrator talk only to the [`Transport`] trait, so the
//! same command semantics hold over physically dissimilar links.
//!
//! ```text
//! +--------------------+     +--------------------+
//! |  CommandChannel    |     |  UpgradeSession    |
//! |  (engine)          |     |  (orchestrator)    |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+--------------------------+----------+
//! |              Transport trait                  |
//! +--+---------+---------+--------+-------+-------+
//!    |         |         |        |       |
//!  serial    i2c    usb-ctrl  usb-i2c   spi/video
//! ```

#[cfg(feature = "native")]
pub mod serial;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::{Error, Result, TransportError};
use crate::protocol::frame::{MAX_PAYLOAD, REGISTER_PAYLOAD_LIMIT};
use std::fmt;

/// Which physical transport a command channel is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelKind {
    /// UART/serial port.
    Serial,
    /// Direct I2C bus node.
    I2c,
    /// USB control transfers.
    UsbControl,
    /// I2C tunneled over USB bulk transfers.
    UsbBulkI2c,
    /// SPI device node.
    Spi,
    /// Memory-mapped video capture node (command side-channel).
    VideoNode,
}

impl ChannelKind {
    /// Default image chunk size for downloads over this channel.
    ///
    /// Register-style channels are limited to small command payloads; bulk
    /// and streaming channels tolerate larger chunks. Register-style sizes
    /// leave room for the 4-byte offset prefix a chunk payload carries, so
    /// chunk + offset always fits [`max_command_payload`](Self::max_command_payload).
    #[must_use]
    pub fn default_chunk_size(&self) -> usize {
        match self {
            Self::Serial => 1024,
            Self::I2c | Self::UsbControl => REGISTER_PAYLOAD_LIMIT - 4,
            Self::UsbBulkI2c => 256,
            Self::Spi => 4096,
            Self::VideoNode => 512,
        }
    }

    /// Largest command payload this channel accepts in a single frame.
    ///
    /// Register-style channels move commands through a small register
    /// window; the rest take payloads up to the protocol maximum.
    #[must_use]
    pub fn max_command_payload(&self) -> usize {
        match self {
            Self::I2c | Self::UsbControl => REGISTER_PAYLOAD_LIMIT,
            Self::Serial | Self::UsbBulkI2c | Self::Spi | Self::VideoNode => MAX_PAYLOAD,
        }
    }

    /// Descriptor prefix accepted by [`NodeDescriptor::parse`].
    #[must_use]
    pub fn descriptor_prefix(&self) -> &'static str {
        match self {
            Self::Serial => "UART",
            Self::I2c => "I2C",
            Self::UsbControl => "USB",
            Self::UsbBulkI2c => "USB_I2C",
            Self::Spi => "SPI",
            Self::VideoNode => "VIDEO",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Serial => "serial",
            Self::I2c => "i2c",
            Self::UsbControl => "usb-control",
            Self::UsbBulkI2c => "usb-bulk-i2c",
            Self::Spi => "spi",
            Self::VideoNode => "video-node",
        };
        write!(f, "{name}")
    }
}

/// Which code the attached unit is currently running.
///
/// Queried once before any firmware transfer decision; a download never
/// proceeds while the mode is [`DeviceMode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceMode {
    /// Mode could not be determined.
    #[default]
    Unknown,
    /// ROM/bootloader code.
    Rom,
    /// Cached application code.
    CachedApplication,
}

impl DeviceMode {
    /// Decode the mode byte reported by the device (0/1/2).
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Rom,
            2 => Self::CachedApplication,
            _ => Self::Unknown,
        }
    }
}

/// Transport handle lifecycle.
///
/// `Closed -> Open -> Initialized -> (Idle | Streaming | Upgrading) -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    /// No hardware resource is owned.
    #[default]
    Closed,
    /// Resource acquired, settings not yet applied.
    Open,
    /// Settings applied, ready for command exchanges.
    Initialized,
    /// Idle between exchanges.
    Idle,
    /// Video streaming is active alongside the command path.
    Streaming,
    /// A firmware/bootloader transfer is in progress.
    Upgrading,
}

impl TransportState {
    /// Whether raw command I/O is allowed in this state.
    #[must_use]
    pub fn allows_io(&self) -> bool {
        matches!(
            self,
            Self::Initialized | Self::Idle | Self::Streaming | Self::Upgrading
        )
    }
}

/// Parsed device descriptor: channel kind plus OS node/address string.
///
/// Accepted forms:
///
/// ```text
/// UART:/dev/ttyUSB0        I2C:/dev/i2c-1
/// USB:vid=0x3474,pid=0x0020,sameidx=0
/// USB_I2C:vid=0x3474,pid=0x0020
/// SPI:/dev/spidev0.0       VIDEO:/dev/video30
/// ```
///
/// A trailing `;` is tolerated for compatibility with existing device lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Resolved channel kind.
    pub kind: ChannelKind,
    /// Transport-specific node path or address string.
    pub node: String,
}

impl NodeDescriptor {
    /// Parse a descriptor string into a channel kind and node.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let trimmed = descriptor.trim().trim_end_matches(';');
        let (prefix, node) = trimmed.split_once(':').ok_or_else(|| {
            Error::Parameter(format!("descriptor missing ':' separator: {descriptor:?}"))
        })?;

        let kind = match prefix {
            "UART" => ChannelKind::Serial,
            "I2C" => ChannelKind::I2c,
            "USB_I2C" => ChannelKind::UsbBulkI2c,
            "USB" => ChannelKind::UsbControl,
            "SPI" => ChannelKind::Spi,
            "VIDEO" => ChannelKind::VideoNode,
            other => {
                return Err(Error::Parameter(format!(
                    "unknown descriptor prefix: {other:?}"
                )));
            },
        };

        if node.is_empty() {
            return Err(Error::Parameter(format!(
                "descriptor has empty node: {descriptor:?}"
            )));
        }

        Ok(Self {
            kind,
            node: node.to_string(),
        })
    }
}

/// Transport-specific initialization settings.
#[derive(Debug, Clone)]
pub enum InitParams {
    /// UART settings.
    Serial {
        /// Baud rate.
        baud_rate: u32,
        /// Per-operation read/write timeout in milliseconds.
        timeout_ms: u64,
    },
    /// I2C settings.
    I2c {
        /// 7-bit device address.
        address: u16,
    },
    /// USB settings.
    Usb {
        /// Interface/pipe selector.
        interface: u8,
    },
    /// SPI settings.
    Spi {
        /// Clock speed in Hz.
        speed_hz: u32,
        /// SPI mode (0..=3).
        mode: u8,
    },
    /// Video capture node settings.
    Video {
        /// Number of capture buffers to request.
        buffer_count: u32,
    },
    /// No transport-specific settings.
    None,
}

/// Per-operation I/O parameters.
///
/// Register-style transports address a command window through a register;
/// stream transports ignore this.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoParam {
    /// Target register address for register-style transports.
    pub reg_addr: u16,
}

/// Progress callback used by native bulk download paths (percent, 0..=100).
pub type NativeProgress<'a> = &'a mut dyn FnMut(u8);

/// The capability contract every transport backend implements.
///
/// All operations are bounded: `raw_read`/`raw_write` perform exactly one
/// I/O operation, can time out or fail, and never retry internally. At most
/// one command exchange may be in flight per handle; the `&mut self` receiver
/// enforces that for a single channel, and callers must serialize access
/// across threads themselves.
pub trait Transport: Send {
    /// Acquire the OS-level resource named by the descriptor.
    fn open(&mut self, descriptor: &NodeDescriptor) -> std::result::Result<(), TransportError>;

    /// Apply transport-specific settings.
    fn initialize(&mut self, params: &InitParams) -> std::result::Result<(), TransportError>;

    /// Perform exactly one bounded read; returns the number of bytes read.
    fn raw_read(
        &mut self,
        param: &IoParam,
        buf: &mut [u8],
    ) -> std::result::Result<usize, TransportError>;

    /// Perform exactly one bounded write of the whole buffer.
    fn raw_write(&mut self, param: &IoParam, data: &[u8])
    -> std::result::Result<(), TransportError>;

    /// Write asserting that no status read will follow.
    ///
    /// Fire-and-forget: only the write is confirmed, never the device-side
    /// effect.
    fn write_without_confirmation(
        &mut self,
        param: &IoParam,
        data: &[u8],
    ) -> std::result::Result<(), TransportError> {
        self.raw_write(param, data)
    }

    /// Query whether the attached unit runs ROM or cached application code.
    fn detect_device_mode(&mut self) -> std::result::Result<DeviceMode, TransportError>;

    /// Which transport variant this is.
    fn channel_kind(&self) -> ChannelKind;

    /// Transport-native bulk firmware download, when the link offers a
    /// faster path than chunked command writes.
    ///
    /// The default is unsupported; the download orchestrator then falls back
    /// to chunked command writes.
    fn download_firmware(
        &mut self,
        _image: &[u8],
        _progress: NativeProgress<'_>,
    ) -> std::result::Result<(), TransportError> {
        Err(TransportError::Unsupported(
            "native firmware download".into(),
        ))
    }

    /// Transport-native bulk bootloader download.
    fn download_bootloader(
        &mut self,
        _image: &[u8],
        _progress: NativeProgress<'_>,
    ) -> std::result::Result<(), TransportError> {
        Err(TransportError::Unsupported(
            "native bootloader download".into(),
        ))
    }

    /// Reverse of [`Transport::initialize`]. Callable after failures.
    fn release(&mut self, params: &InitParams) -> std::result::Result<(), TransportError>;

    /// Reverse of [`Transport::open`]. Callable after failures; must not
    /// panic.
    fn close(&mut self) -> std::result::Result<(), TransportError>;
}
