//! Reference serial transport using the `serialport` crate.
//!
//! This is the one backend this crate ships on native platforms (Linux,
//! macOS, Windows). Other channel kinds are implemented by embedding
//! applications against the [`Transport`](crate::transport::Transport) trait.

use crate::error::TransportError;
use crate::protocol::frame::{self, Opcode, STATUS_OK};
use crate::transport::{
    ChannelKind, DeviceMode, InitParams, IoParam, NativeProgress, NodeDescriptor, Transport,
    TransportState,
};
use log::{debug, trace};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Default baud rate applied when [`InitParams::None`] is given.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default per-operation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Window for the device-mode probe exchange.
const MODE_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Serial transport backend.
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    state: TransportState,
    node: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialTransport {
    /// Create an unopened serial transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            port: None,
            state: TransportState::Closed,
            node: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransportState {
        self.state
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, TransportError> {
        if !self.state.allows_io() {
            return Err(TransportError::NotReady(format!(
                "serial port in state {:?}",
                self.state
            )));
        }
        self.port
            .as_mut()
            .ok_or_else(|| TransportError::NotReady("serial port not open".into()))
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, descriptor: &NodeDescriptor) -> Result<(), TransportError> {
        if descriptor.kind != ChannelKind::Serial {
            return Err(TransportError::OpenFailed(format!(
                "descriptor is for {}, not serial",
                descriptor.kind
            )));
        }
        let port = serialport::new(&descriptor.node, DEFAULT_BAUD)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(TransportError::Serial)?;

        debug!("opened serial node {}", descriptor.node);
        self.port = Some(port);
        self.node = descriptor.node.clone();
        self.state = TransportState::Open;
        Ok(())
    }

    fn initialize(&mut self, params: &InitParams) -> Result<(), TransportError> {
        let (baud_rate, timeout) = match params {
            InitParams::Serial {
                baud_rate,
                timeout_ms,
            } => (*baud_rate, Duration::from_millis(*timeout_ms)),
            InitParams::None => (DEFAULT_BAUD, DEFAULT_TIMEOUT),
            other => {
                return Err(TransportError::InitFailed(format!(
                    "expected serial init params, got {other:?}"
                )));
            },
        };

        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::InitFailed("port not open".into()))?;
        port.set_baud_rate(baud_rate)?;
        port.set_timeout(timeout)?;
        port.clear(serialport::ClearBuffer::All)?;

        self.baud_rate = baud_rate;
        self.timeout = timeout;
        self.state = TransportState::Initialized;
        debug!("serial {} initialized at {baud_rate} baud", self.node);
        Ok(())
    }

    fn raw_read(&mut self, _param: &IoParam, buf: &mut [u8]) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        match port.read(buf) {
            Ok(n) => {
                trace!("serial read {n} bytes");
                Ok(n)
            },
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(TransportError::TimedOut("serial read".into()))
            },
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn raw_write(&mut self, _param: &IoParam, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        trace!("serial wrote {} bytes", data.len());
        Ok(())
    }

    fn detect_device_mode(&mut self) -> Result<DeviceMode, TransportError> {
        let probe = frame::encode(Opcode::DEVICE_MODE, &[]).to_bytes();
        self.raw_write(&IoParam::default(), &probe)?;

        // Poll bounded by the probe window, buffering partial frames.
        let deadline = Instant::now() + MODE_PROBE_TIMEOUT;
        let mut rx = Vec::new();
        let mut buf = [0u8; 64];
        while Instant::now() < deadline {
            match self.raw_read(&IoParam::default(), &mut buf) {
                Ok(0) | Err(TransportError::TimedOut(_)) => continue,
                Ok(n) => rx.extend_from_slice(&buf[..n]),
                Err(e) => return Err(e),
            }
            match frame::decode(&rx) {
                Ok(response) => {
                    let mode = match response.payload.as_slice() {
                        [STATUS_OK, raw, ..] => DeviceMode::from_raw(*raw),
                        _ => DeviceMode::Unknown,
                    };
                    debug!("device mode probe: {mode:?}");
                    return Ok(mode);
                },
                Err(crate::error::FramingError::Truncated { .. }) => {},
                Err(_) => return Ok(DeviceMode::Unknown),
            }
        }
        Ok(DeviceMode::Unknown)
    }

    fn channel_kind(&self) -> ChannelKind {
        ChannelKind::Serial
    }

    fn release(&mut self, _params: &InitParams) -> Result<(), TransportError> {
        if let Some(port) = self.port.as_mut() {
            // Best effort: draining buffers on a dead port is not an error.
            let _ = port.clear(serialport::ClearBuffer::All);
            self.state = TransportState::Open;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            debug!("closed serial node {}", self.node);
        }
        self.state = TransportState::Closed;
        Ok(())
    }

    fn download_firmware(
        &mut self,
        _image: &[u8],
        _progress: NativeProgress<'_>,
    ) -> Result<(), TransportError> {
        // Serial has no bulk side-channel; the orchestrator chunks instead.
        Err(TransportError::Unsupported(
            "serial uses chunked command writes".into(),
        ))
    }

    fn download_bootloader(
        &mut self,
        _image: &[u8],
        _progress: NativeProgress<'_>,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(
            "serial uses chunked command writes".into(),
        ))
    }
}
