//! Firmware and bootloader download orchestration.
//!
//! An [`UpgradeSession`] drives a complete image transfer over an existing
//! [`CommandChannel`]: it checks the device boot mode, prefers the
//! transport's native bulk path when one exists, otherwise splits the image
//! into transport-sized chunks and pushes each one as an ordinary write
//! command. The session owns retry policy (the engine below never retries)
//! and finishes with a checksum readback of the downloaded image.
//!
//! Transfers can be cancelled between chunks through a [`CancelToken`];
//! an in-flight chunk is never torn mid-write.

use crate::channel::{ChannelEvent, CommandChannel};
use crate::error::{Error, Result, TransportError};
use crate::protocol::checksum::checksum16;
use crate::protocol::frame::Opcode;
use crate::transport::DeviceMode;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Little-endian offset prefixed to every chunk payload.
const CHUNK_OFFSET_LEN: usize = 4;

/// Byte offset of chunk `index`, bounded by the 32-bit wire field.
fn chunk_offset(index: usize, chunk_size: usize) -> Result<u32> {
    index
        .checked_mul(chunk_size)
        .and_then(|offset| u32::try_from(offset).ok())
        .ok_or_else(|| Error::Parameter("image exceeds the 32-bit chunk offset range".into()))
}

/// Which image an upgrade session transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeKind {
    /// Application firmware. Allowed in any determined boot mode.
    Firmware,
    /// Bootloader image. Only allowed while the device runs ROM code.
    Bootloader,
}

impl UpgradeKind {
    fn chunk_opcode(self) -> Opcode {
        match self {
            Self::Firmware => Opcode::FIRMWARE_CHUNK,
            Self::Bootloader => Opcode::BOOTLOADER_CHUNK,
        }
    }
}

/// Progress snapshot delivered to the session's sink after every chunk.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    /// Which image is being transferred.
    pub kind: UpgradeKind,
    /// Percentage transferred, 0..=100. Monotonic within a session.
    pub percent: u8,
    /// Bytes acknowledged by the device so far.
    pub bytes_transferred: u64,
    /// Total image size.
    pub total_bytes: u64,
}

/// Cooperative cancellation handle, checked between chunks.
///
/// Clones share the same flag, so a token handed to another thread can stop
/// a transfer driven here.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect before the next chunk is sent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tunables for one upgrade session.
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Chunk size override. Defaults to the channel kind's native size.
    pub chunk_size: Option<usize>,
    /// Retries per chunk after a timeout or transport fault. Device-reported
    /// errors are never retried.
    pub max_chunk_retries: u32,
    /// Read back the device-computed image checksum after the transfer.
    pub verify: bool,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            max_chunk_retries: 3,
            verify: true,
        }
    }
}

/// One firmware or bootloader transfer bound to a command channel.
pub struct UpgradeSession<'a> {
    channel: &'a mut CommandChannel,
    kind: UpgradeKind,
    options: UpgradeOptions,
    cancel: CancelToken,
    sink: Option<&'a mut dyn FnMut(&ProgressEvent)>,
}

impl<'a> UpgradeSession<'a> {
    /// Prepare a session. Nothing is sent until [`run`](Self::run).
    pub fn new(channel: &'a mut CommandChannel, kind: UpgradeKind) -> Self {
        Self {
            channel,
            kind,
            options: UpgradeOptions::default(),
            cancel: CancelToken::new(),
            sink: None,
        }
    }

    /// Replace the default options.
    #[must_use]
    pub fn with_options(mut self, options: UpgradeOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a per-chunk progress sink.
    #[must_use]
    pub fn on_progress(mut self, sink: &'a mut dyn FnMut(&ProgressEvent)) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use an externally held token instead of the session's own.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Handle for cancelling this session from elsewhere.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Transfer `image` to completion, error, or cancellation.
    pub fn run(mut self, image: &[u8]) -> Result<()> {
        if image.is_empty() {
            return Err(Error::Parameter("image is empty".into()));
        }

        let mode = self.channel.detect_device_mode()?;
        match (self.kind, mode) {
            (_, DeviceMode::Unknown) => return Err(Error::DeviceModeUndetermined),
            (UpgradeKind::Bootloader, DeviceMode::CachedApplication) => {
                return Err(Error::Unsupported(
                    "bootloader download requires the device to run ROM code".into(),
                ));
            },
            _ => {},
        }
        info!(
            "starting {:?} download: {} bytes, device in {mode:?} mode",
            self.kind,
            image.len()
        );

        match self.try_native(image) {
            Ok(true) => {},
            Ok(false) => self.run_chunked(image)?,
            Err(e) => return Err(e),
        }

        if self.options.verify {
            self.verify(image)?;
        }
        info!("{:?} download complete", self.kind);
        Ok(())
    }

    /// Attempt the transport-native bulk path. Returns `Ok(false)` when the
    /// backend has none and the chunked fallback should run.
    ///
    /// Native progress is forwarded to the sink as the transport emits it,
    /// not replayed afterwards. The channel is mutably borrowed for the
    /// whole call, so channel-level telemetry is emitted once it returns.
    fn try_native(&mut self, image: &[u8]) -> Result<bool> {
        let bootloader = self.kind == UpgradeKind::Bootloader;
        let kind = self.kind;
        let total = image.len() as u64;
        let mut sink = self.sink.take();
        let mut last_percent: u8 = 0;
        let outcome = self.channel.native_download(bootloader, image, &mut |percent| {
            last_percent = percent;
            if let Some(sink) = sink.as_mut() {
                sink(&ProgressEvent {
                    kind,
                    percent,
                    bytes_transferred: total * u64::from(percent) / 100,
                    total_bytes: total,
                });
            }
        });
        self.sink = sink;
        match outcome {
            Ok(()) => {
                debug!("native bulk download path used");
                self.channel.set_transfer_percentage(f32::from(last_percent));
                self.channel.emit(&ChannelEvent::TransferProgress {
                    percent: last_percent,
                    bytes_transferred: total * u64::from(last_percent) / 100,
                    total_bytes: total,
                });
                Ok(true)
            },
            Err(TransportError::Unsupported(_)) => Ok(false),
            Err(e) => Err(Error::transport(self.channel.channel_kind(), e)),
        }
    }

    /// Push the image as offset-prefixed write commands.
    #[allow(clippy::cast_possible_truncation)] // percent is always <= 100
    fn run_chunked(&mut self, image: &[u8]) -> Result<()> {
        let chunk_size = self
            .options
            .chunk_size
            .unwrap_or_else(|| self.channel.channel_kind().default_chunk_size());
        if chunk_size == 0 {
            return Err(Error::Parameter("chunk size must be > 0".into()));
        }
        let max_payload = self.channel.channel_kind().max_command_payload();
        if chunk_size + CHUNK_OFFSET_LEN > max_payload {
            return Err(Error::Parameter(format!(
                "chunk size {chunk_size} plus {CHUNK_OFFSET_LEN}-byte offset exceeds \
                 the {} payload bound of {max_payload}",
                self.channel.channel_kind()
            )));
        }

        let opcode = self.kind.chunk_opcode();
        let total = image.len() as u64;
        debug!(
            "chunked download: {total} bytes in {} byte chunks via {opcode}",
            chunk_size
        );
        self.report(0, 0, total);

        let mut sent: u64 = 0;
        for (index, chunk) in image.chunks(chunk_size).enumerate() {
            if self.cancel.is_cancelled() {
                info!("download cancelled after {sent}/{total} bytes");
                return Err(Error::Cancelled);
            }

            let offset = chunk_offset(index, chunk_size)?;
            let mut payload = Vec::with_capacity(CHUNK_OFFSET_LEN + chunk.len());
            payload.extend_from_slice(&offset.to_le_bytes());
            payload.extend_from_slice(chunk);
            self.write_chunk(opcode, index, &payload)?;

            sent += chunk.len() as u64;
            self.report((sent * 100 / total) as u8, sent, total);
        }
        Ok(())
    }

    /// Write one chunk, retrying timeouts and transport faults.
    fn write_chunk(&mut self, opcode: Opcode, index: usize, payload: &[u8]) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            match self.channel.write(opcode, payload) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // Only transient conditions are worth resending the same
                    // bytes for: a missed status window or a failed I/O
                    // operation. Lifecycle and capability errors are not.
                    let retryable = matches!(
                        e,
                        Error::Timeout(_)
                            | Error::Transport {
                                source: TransportError::TimedOut(_)
                                    | TransportError::Io(_)
                                    | TransportError::WriteFailed(_),
                                ..
                            }
                    );
                    if !retryable {
                        // Device-side rejection or framing fault; retrying
                        // the same bytes cannot help.
                        return Err(e);
                    }
                    attempts += 1;
                    if attempts > self.options.max_chunk_retries {
                        return Err(Error::DownloadAborted(format!(
                            "chunk {index} failed after {attempts} attempts: {e}"
                        )));
                    }
                    warn!("chunk {index} attempt {attempts} failed: {e}, retrying");
                },
            }
        }
    }

    /// Compare the device-computed image checksum against the host's.
    fn verify(&mut self, image: &[u8]) -> Result<()> {
        let data = self.channel.query(Opcode::UPGRADE_VERIFY, &[])?;
        if data.len() < 2 {
            return Err(Error::VerificationFailed(format!(
                "checksum readback returned {} bytes, expected 2",
                data.len()
            )));
        }
        let reported = u16::from_le_bytes([data[0], data[1]]);
        let expected = checksum16(image);
        if reported != expected {
            return Err(Error::VerificationFailed(format!(
                "device checksum {reported:#06x} != host checksum {expected:#06x}"
            )));
        }
        debug!("image checksum verified: {expected:#06x}");
        Ok(())
    }

    fn report(&mut self, percent: u8, bytes_transferred: u64, total_bytes: u64) {
        self.channel.set_transfer_percentage(f32::from(percent));
        self.channel.emit(&ChannelEvent::TransferProgress {
            percent,
            bytes_transferred,
            total_bytes,
        });
        if let Some(sink) = self.sink.as_mut() {
            sink(&ProgressEvent {
                kind: self.kind,
                percent,
                bytes_transferred,
                total_bytes,
            });
        }
    }
}
