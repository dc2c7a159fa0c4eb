//! Error types for thermocmd.

use std::io;
use thiserror::Error;

use crate::transport::ChannelKind;

/// Result type for thermocmd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a transport backend.
///
/// Every backend maps its platform failures onto this one enum; the
/// originating channel is attached by [`Error::Transport`] so callers never
/// deal with per-transport error types.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the OS-level resource failed (bad descriptor, device busy).
    #[error("open failed: {0}")]
    OpenFailed(String),

    /// Applying transport-specific settings failed.
    #[error("init failed: {0}")]
    InitFailed(String),

    /// I/O error during a bounded read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A single bounded I/O operation timed out.
    ///
    /// During status polling this is not terminal; the engine keeps polling
    /// until its own deadline expires.
    #[error("transfer timed out: {0}")]
    TimedOut(String),

    /// A write was submitted but not accepted by the device.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Releasing the transport configuration failed.
    #[error("release failed: {0}")]
    ReleaseFailed(String),

    /// Closing the transport failed.
    #[error("close failed: {0}")]
    CloseFailed(String),

    /// Operation attempted in a lifecycle state that does not allow it.
    #[error("transport not ready: {0}")]
    NotReady(String),

    /// The backend does not implement this operation.
    #[error("unsupported by this transport: {0}")]
    Unsupported(String),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Errors from the pure framing layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Fewer bytes available than the frame's declared length.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the declared length requires.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// Checksum validation failed.
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// Checksum recomputed over the received bytes.
        expected: u16,
        /// Checksum carried by the frame.
        actual: u16,
    },

    /// Declared payload length exceeds the protocol maximum.
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Declared payload length.
        len: usize,
        /// Maximum allowed payload length.
        max: usize,
    },
}

/// Error type for thermocmd operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid argument (zero timeout, oversized payload, bad descriptor).
    #[error("parameter error: {0}")]
    Parameter(String),

    /// A transport operation failed.
    #[error("{channel} transport error: {source}")]
    Transport {
        /// Channel kind the failing transport is bound to.
        channel: ChannelKind,
        /// The underlying transport failure.
        source: TransportError,
    },

    /// Frame encoding or validation failed.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The device executed the command and replied with a failure status.
    ///
    /// Not a transport fault; this layer never retries it.
    #[error("device reported error {code:#04x} for opcode {opcode:#06x}")]
    DeviceReported {
        /// Opcode of the rejected command.
        opcode: u16,
        /// Device-side status code.
        code: u8,
    },

    /// No valid status frame arrived within the configured polling window.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation not available on this channel or build.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A checksum-valid frame arrived with the wrong opcode echo.
    #[error("unexpected response: expected opcode {expected:#06x}, got {actual:#06x}")]
    UnexpectedResponse {
        /// Opcode of the command that was sent.
        expected: u16,
        /// Opcode echoed by the device.
        actual: u16,
    },

    /// The device boot mode could not be determined before a download.
    #[error("device mode undetermined; refusing to start download")]
    DeviceModeUndetermined,

    /// A firmware/bootloader transfer gave up after bounded retries.
    #[error("download aborted: {0}")]
    DownloadAborted(String),

    /// All chunks transferred but the post-download readback did not match.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The transfer was cancelled between chunks.
    #[error("transfer cancelled")]
    Cancelled,
}

impl Error {
    /// Attach the originating channel kind to a transport failure.
    pub(crate) fn transport(channel: ChannelKind, source: TransportError) -> Self {
        Self::Transport { channel, source }
    }
}
