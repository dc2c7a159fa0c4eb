//! Command channel and execution engine.
//!
//! A [`CommandChannel`] binds the execution engine to exactly one transport
//! for the channel's lifetime. Each invocation walks the same state machine:
//!
//! ```text
//! Idle -> Sending -> (needs status? Polling : Done)
//!                     -> Success | DeviceReported | Framing | Timeout
//! ```
//!
//! The engine frames the command, delegates raw I/O to the transport,
//! validates the response checksum, and interprets only the status byte;
//! payload meaning belongs to the caller. It never retries a failed
//! exchange; retry policy belongs to callers such as the download
//! orchestrator.
//!
//! Calls are synchronous and blocking; `&mut self` guarantees at most one
//! exchange in flight per channel. Status polling is the only suspension
//! point, a busy/backoff loop bounded by the configured polling timeout.

use crate::error::{Error, FramingError, Result, TransportError};
use crate::protocol::frame::{self, Direction, Opcode, STATUS_BUSY, STATUS_OK};
use crate::transport::{ChannelKind, DeviceMode, IoParam, Transport};
use log::{debug, trace, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Default polling timeout for status-bearing commands.
pub const DEFAULT_POLLING_TIMEOUT: Duration = Duration::from_millis(2000);

/// Backoff between empty polls.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Read buffer size for one poll iteration.
const POLL_READ_CHUNK: usize = 4096;

/// Engine-local configuration for a command channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How long to poll for a status frame before giving up. Must be > 0.
    pub polling_timeout: Duration,
    /// Backoff between empty polls.
    pub poll_interval: Duration,
    /// Per-operation I/O parameters handed to the transport.
    pub io_param: IoParam,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            polling_timeout: DEFAULT_POLLING_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            io_param: IoParam::default(),
        }
    }
}

/// Telemetry events surfaced through the channel's optional callback.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A command exchange reached a terminal state.
    CommandCompleted {
        /// Opcode of the command.
        opcode: Opcode,
        /// Wall-clock duration of the exchange.
        elapsed: Duration,
    },
    /// A firmware/bootloader transfer advanced.
    TransferProgress {
        /// Percentage transferred, 0..=100.
        percent: u8,
        /// Bytes transferred so far.
        bytes_transferred: u64,
        /// Total bytes in the image.
        total_bytes: u64,
    },
}

/// Callback receiving [`ChannelEvent`]s, invoked synchronously from the
/// driving thread.
pub type EventCallback = Box<dyn FnMut(&ChannelEvent) + Send>;

/// A command execution engine bound to exactly one transport.
pub struct CommandChannel {
    transport: Box<dyn Transport>,
    kind: ChannelKind,
    config: ChannelConfig,
    callback: Option<EventCallback>,
    transfer_percent: f32,
}

impl CommandChannel {
    /// Bind a channel to an opened, initialized transport.
    ///
    /// The channel kind is queried once here and cached.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_config(transport, ChannelConfig::default())
    }

    /// Bind a channel with explicit engine configuration.
    pub fn with_config(transport: Box<dyn Transport>, config: ChannelConfig) -> Self {
        let kind = transport.channel_kind();
        Self {
            transport,
            kind,
            config,
            callback: None,
            transfer_percent: 0.0,
        }
    }

    /// Which physical transport this channel is bound to (cached).
    #[must_use]
    pub fn channel_kind(&self) -> ChannelKind {
        self.kind
    }

    /// Set the polling timeout for status-bearing commands.
    pub fn set_polling_timeout(&mut self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::Parameter("polling timeout must be > 0".into()));
        }
        self.config.polling_timeout = timeout;
        Ok(())
    }

    /// Current polling timeout.
    #[must_use]
    pub fn polling_timeout(&self) -> Duration {
        self.config.polling_timeout
    }

    /// Register a callback for progress/telemetry events.
    pub fn set_event_callback(&mut self, callback: EventCallback) {
        self.callback = Some(callback);
    }

    /// Remove the registered event callback, if any.
    pub fn clear_event_callback(&mut self) {
        self.callback = None;
    }

    /// Percentage of the most recent data transfer, 0.0..=100.0.
    #[must_use]
    pub fn transfer_percentage(&self) -> f32 {
        self.transfer_percent
    }

    /// Query the device boot mode through the bound transport.
    pub fn detect_device_mode(&mut self) -> Result<DeviceMode> {
        self.transport
            .detect_device_mode()
            .map_err(|e| Error::transport(self.kind, e))
    }

    /// Issue a query command and return its response data.
    pub fn query(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>> {
        self.execute(opcode, Direction::Read, payload)
    }

    /// Issue a write command and wait for its completion status.
    pub fn write(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        self.execute(opcode, Direction::Write, payload).map(|_| ())
    }

    /// Issue a fire-and-forget write.
    ///
    /// Completes as soon as the write is accepted; the device-side effect is
    /// deliberately unconfirmed. Callers needing certainty must follow up
    /// with a query.
    pub fn write_unconfirmed(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        self.execute(opcode, Direction::WriteNoStatus, payload)
            .map(|_| ())
    }

    /// Execute one command exchange to a terminal state.
    pub fn execute(
        &mut self,
        opcode: Opcode,
        direction: Direction,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let max_payload = self.kind.max_command_payload();
        if payload.len() > max_payload {
            return Err(Error::Parameter(format!(
                "payload of {} bytes exceeds the {} bound of {max_payload}",
                payload.len(),
                self.kind
            )));
        }

        let started = Instant::now();
        let bytes = frame::encode(opcode, payload)
            .with_direction(direction)
            .to_bytes();
        trace!("sending {opcode} ({} bytes, {direction:?})", bytes.len());

        // Sending
        let result = match direction {
            Direction::WriteNoStatus => self
                .transport
                .write_without_confirmation(&self.config.io_param, &bytes)
                .map(|()| Vec::new())
                .map_err(|e| Error::transport(self.kind, e)),
            Direction::Read | Direction::Write => {
                match self.transport.raw_write(&self.config.io_param, &bytes) {
                    Ok(()) => self.poll_status(opcode),
                    Err(e) => Err(Error::transport(self.kind, e)),
                }
            },
        };

        match &result {
            Ok(_) => trace!("{opcode} completed in {:?}", started.elapsed()),
            Err(e) => debug!("{opcode} failed: {e}"),
        }
        self.emit(&ChannelEvent::CommandCompleted {
            opcode,
            elapsed: started.elapsed(),
        });
        result
    }

    /// Poll for the status/response frame of `sent`.
    ///
    /// Buffers partial frames and checksum-checks only once fully assembled.
    /// Per-read timeouts from the transport are not terminal; only the
    /// engine's own deadline is.
    fn poll_status(&mut self, sent: Opcode) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.config.polling_timeout;
        let mut rx: Vec<u8> = Vec::new();
        let mut buf = [0u8; POLL_READ_CHUNK];

        loop {
            let mut got_data = false;
            match self.transport.raw_read(&self.config.io_param, &mut buf) {
                Ok(0) | Err(TransportError::TimedOut(_)) => {},
                Ok(n) => {
                    rx.extend_from_slice(&buf[..n]);
                    got_data = true;
                },
                Err(e) => return Err(Error::transport(self.kind, e)),
            }

            if got_data {
                match frame::decode(&rx) {
                    Ok(response) => {
                        match self.classify_response(sent, &response)? {
                            Some(data) => return Ok(data),
                            // Device still executing; discard the busy frame
                            // and keep polling.
                            None => rx.clear(),
                        }
                    },
                    Err(FramingError::Truncated { needed, available }) => {
                        trace!("partial status frame for {sent}: {available}/{needed} bytes");
                    },
                    Err(e) => return Err(e.into()),
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    "no valid status frame for {sent} within {:?}",
                    self.config.polling_timeout
                );
                return Err(Error::Timeout(format!(
                    "no status frame for opcode {sent} within {} ms",
                    self.config.polling_timeout.as_millis()
                )));
            }
            if !got_data {
                thread::sleep(self.config.poll_interval);
            }
        }
    }

    /// Interpret a checksum-valid response frame.
    ///
    /// Returns `Ok(Some(data))` on success, `Ok(None)` if the device is
    /// still executing, or the terminal error.
    fn classify_response(
        &self,
        sent: Opcode,
        response: &frame::CommandFrame,
    ) -> Result<Option<Vec<u8>>> {
        if response.opcode != sent {
            return Err(Error::UnexpectedResponse {
                expected: sent.0,
                actual: response.opcode.0,
            });
        }
        // A status frame carries at least the status byte.
        let Some(&status) = response.payload.first() else {
            return Err(Error::UnexpectedResponse {
                expected: sent.0,
                actual: response.opcode.0,
            });
        };
        match status {
            STATUS_OK => Ok(Some(response.payload[1..].to_vec())),
            STATUS_BUSY => {
                trace!("{sent} busy, polling continues");
                Ok(None)
            },
            code => Err(Error::DeviceReported {
                opcode: sent.0,
                code,
            }),
        }
    }

    pub(crate) fn emit(&mut self, event: &ChannelEvent) {
        if let Some(callback) = self.callback.as_mut() {
            callback(event);
        }
    }

    pub(crate) fn set_transfer_percentage(&mut self, percent: f32) {
        self.transfer_percent = percent;
    }

    pub(crate) fn native_download(
        &mut self,
        bootloader: bool,
        image: &[u8],
        progress: &mut dyn FnMut(u8),
    ) -> std::result::Result<(), TransportError> {
        if bootloader {
            self.transport.download_bootloader(image, progress)
        } else {
            self.transport.download_firmware(image, progress)
        }
    }

    /// Consume the channel and return its transport.
    #[must_use]
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{MAX_PAYLOAD, REGISTER_PAYLOAD_LIMIT};
    use crate::transport::testing::{
        MockTransport, busy_frame, data_frame, device_error_frame, ok_frame,
    };

    fn fast_channel(mock: MockTransport) -> CommandChannel {
        let mut channel = CommandChannel::new(Box::new(mock));
        channel
            .set_polling_timeout(Duration::from_millis(100))
            .unwrap();
        channel
    }

    #[test]
    fn test_write_success() {
        let mut mock = MockTransport::new(ChannelKind::Serial);
        mock.respond_with(|f| Some(ok_frame(f.opcode)));
        let written = mock.written_log();
        let mut channel = fast_channel(mock);
        channel.write(Opcode(0x0200), &[0x01, 0x02]).unwrap();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].opcode, Opcode(0x0200));
        assert_eq!(written[0].payload, vec![0x01, 0x02]);
    }

    #[test]
    fn test_query_returns_data_without_status_byte() {
        let mut mock = MockTransport::new(ChannelKind::Serial);
        mock.respond_with(|f| Some(data_frame(f.opcode, &[0xAB, 0xCD])));
        let mut channel = fast_channel(mock);
        let data = channel.query(Opcode(0x0300), &[]).unwrap();
        assert_eq!(data, vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_withheld_status_times_out_bounded() {
        let mock = MockTransport::new(ChannelKind::Serial);
        let mut channel = fast_channel(mock);
        let started = Instant::now();
        let err = channel.write(Opcode(0x0200), &[]).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
        // Bounded: well under a second for a 100 ms window.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_device_error_status_is_terminal() {
        let mut mock = MockTransport::new(ChannelKind::Serial);
        mock.respond_with(|f| Some(device_error_frame(f.opcode, 0x42)));
        let mut channel = fast_channel(mock);
        let err = channel.write(Opcode(0x0200), &[]).unwrap_err();
        match err {
            Error::DeviceReported { opcode, code } => {
                assert_eq!(opcode, 0x0200);
                assert_eq!(code, 0x42);
            },
            other => panic!("expected DeviceReported, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupted_response_is_checksum_mismatch() {
        let mut mock = MockTransport::new(ChannelKind::Serial);
        mock.respond_with(|f| {
            let mut bytes = ok_frame(f.opcode);
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
            Some(bytes)
        });
        let mut channel = fast_channel(mock);
        let err = channel.write(Opcode(0x0200), &[]).unwrap_err();
        assert!(
            matches!(err, Error::Framing(FramingError::ChecksumMismatch { .. })),
            "got {err:?}"
        );
    }

    #[test]
    fn test_wrong_opcode_echo_is_unexpected_response() {
        let mut mock = MockTransport::new(ChannelKind::Serial);
        mock.respond_with(|_| Some(ok_frame(Opcode(0x9999))));
        let mut channel = fast_channel(mock);
        let err = channel.write(Opcode(0x0200), &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedResponse {
                expected: 0x0200,
                actual: 0x9999
            }
        ));
    }

    #[test]
    fn test_partial_frames_are_buffered_until_complete() {
        let mut mock = MockTransport::new(ChannelKind::Serial);
        let response = data_frame(Opcode(0x0300), &[0x77]);
        let (head, tail) = response.split_at(4);
        mock.queue_read(head.to_vec());
        mock.queue_read(tail.to_vec());
        let mut channel = fast_channel(mock);
        let data = channel.query(Opcode(0x0300), &[]).unwrap();
        assert_eq!(data, vec![0x77]);
    }

    #[test]
    fn test_busy_frames_extend_polling_until_completion() {
        let mut mock = MockTransport::new(ChannelKind::Serial);
        mock.respond_with(|f| Some(busy_frame(f.opcode)));
        let mut channel = fast_channel(mock);
        // Busy forever -> the engine must still give up at its own deadline.
        let err = channel.write(Opcode(0x0200), &[]).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    }

    #[test]
    fn test_busy_then_success() {
        let mut mock = MockTransport::new(ChannelKind::Serial);
        mock.queue_read(busy_frame(Opcode(0x0200)));
        mock.queue_read(ok_frame(Opcode(0x0200)));
        let mut channel = fast_channel(mock);
        channel.write(Opcode(0x0200), &[]).unwrap();
    }

    #[test]
    fn test_write_unconfirmed_never_polls() {
        let mut mock = MockTransport::new(ChannelKind::I2c);
        mock.respond_with(|_| panic!("fire-and-forget must not use raw_write"));
        let written = mock.written_log();
        let unconfirmed = mock.unconfirmed_log();
        let mut channel = fast_channel(mock);
        let started = Instant::now();
        channel.write_unconfirmed(Opcode(0x0200), &[0x55]).unwrap();
        // Returns immediately; no status poll window is consumed.
        assert!(started.elapsed() < Duration::from_millis(50));

        assert!(written.lock().unwrap().is_empty());
        let unconfirmed = unconfirmed.lock().unwrap();
        assert_eq!(unconfirmed.len(), 1);
        assert_eq!(unconfirmed[0].payload, vec![0x55]);
    }

    #[test]
    fn test_write_failure_is_terminal_transport_error() {
        let mut mock = MockTransport::new(ChannelKind::Serial);
        mock.fail_next_write(TransportError::WriteFailed("bus stall".into()));
        let mut channel = fast_channel(mock);
        let err = channel.write(Opcode(0x0200), &[]).unwrap_err();
        assert!(
            matches!(
                err,
                Error::Transport {
                    channel: ChannelKind::Serial,
                    ..
                }
            ),
            "got {err:?}"
        );
    }

    #[test]
    fn test_zero_polling_timeout_rejected() {
        let mock = MockTransport::new(ChannelKind::Serial);
        let mut channel = CommandChannel::new(Box::new(mock));
        let err = channel.set_polling_timeout(Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Parameter(_)));
    }

    #[test]
    fn test_oversized_payload_rejected_before_send() {
        let mut mock = MockTransport::new(ChannelKind::Serial);
        mock.respond_with(|_| panic!("oversized payload must not reach the transport"));
        let mut channel = fast_channel(mock);
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        let err = channel.write(Opcode(0x0200), &payload).unwrap_err();
        assert!(matches!(err, Error::Parameter(_)));
    }

    #[test]
    fn test_register_channel_enforces_payload_bound() {
        let mut mock = MockTransport::new(ChannelKind::I2c);
        mock.respond_with(|f| Some(ok_frame(f.opcode)));
        let mut channel = fast_channel(mock);

        // At the bound is fine; one past it is rejected before any I/O.
        let at_limit = vec![0u8; REGISTER_PAYLOAD_LIMIT];
        channel.write(Opcode(0x0200), &at_limit).unwrap();
        let over = vec![0u8; REGISTER_PAYLOAD_LIMIT + 1];
        let err = channel.write(Opcode(0x0200), &over).unwrap_err();
        assert!(matches!(err, Error::Parameter(_)), "got {err:?}");
    }

    #[test]
    fn test_channel_kind_cached_from_transport() {
        let mock = MockTransport::new(ChannelKind::UsbBulkI2c);
        let channel = CommandChannel::new(Box::new(mock));
        assert_eq!(channel.channel_kind(), ChannelKind::UsbBulkI2c);
    }

    #[test]
    fn test_event_callback_sees_completion() {
        use std::sync::{Arc, Mutex};

        let mut mock = MockTransport::new(ChannelKind::Serial);
        mock.respond_with(|f| Some(ok_frame(f.opcode)));
        let mut channel = fast_channel(mock);

        let seen: Arc<Mutex<Vec<Opcode>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.set_event_callback(Box::new(move |event| {
            if let ChannelEvent::CommandCompleted { opcode, .. } = event {
                sink.lock().unwrap().push(*opcode);
            }
        }));

        channel.write(Opcode(0x0200), &[]).unwrap();
        channel.clear_event_callback();
        channel.write(Opcode(0x0201), &[]).unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &[Opcode(0x0200)]);
    }
}
