//! Scripted transport for engine and orchestrator tests.
//!
//! Keeps reads and writes independent: confirmed writes are decoded and
//! logged, and an optional responder closure turns each written command
//! frame into queued response bytes, so tests can model a device end-to-end
//! without hardware. Logs are handed out as shared handles because the
//! transport itself is moved into the channel under test.

use crate::error::TransportError;
use crate::protocol::frame::{self, CommandFrame, STATUS_BUSY, STATUS_OK};
use crate::transport::{
    ChannelKind, DeviceMode, InitParams, IoParam, NativeProgress, NodeDescriptor, Transport,
    TransportState,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Responder = Box<dyn FnMut(&CommandFrame) -> Option<Vec<u8>> + Send>;

/// Shared log of decoded frames, readable after the mock is moved.
pub(crate) type FrameLog = Arc<Mutex<Vec<CommandFrame>>>;

/// Shared log of native downloads as (is_bootloader, image_len).
pub(crate) type NativeLog = Arc<Mutex<Vec<(bool, usize)>>>;

struct NativeScript {
    /// Percent values emitted through the progress callback, in order.
    progress: Vec<u8>,
    log: NativeLog,
}

pub(crate) struct MockTransport {
    pub kind: ChannelKind,
    pub device_mode: DeviceMode,
    pub state: TransportState,
    written: FrameLog,
    unconfirmed: FrameLog,
    native: Option<NativeScript>,
    read_queue: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    fail_writes: VecDeque<TransportError>,
}

impl MockTransport {
    pub(crate) fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            device_mode: DeviceMode::CachedApplication,
            state: TransportState::Initialized,
            written: FrameLog::default(),
            unconfirmed: FrameLog::default(),
            native: None,
            read_queue: VecDeque::new(),
            responder: None,
            fail_writes: VecDeque::new(),
        }
    }

    /// Handle to the confirmed-write log, in write order.
    pub(crate) fn written_log(&self) -> FrameLog {
        Arc::clone(&self.written)
    }

    /// Handle to the log of frames sent through `write_without_confirmation`.
    pub(crate) fn unconfirmed_log(&self) -> FrameLog {
        Arc::clone(&self.unconfirmed)
    }

    /// Queue raw bytes to be returned by subsequent `raw_read` calls.
    pub(crate) fn queue_read(&mut self, bytes: Vec<u8>) {
        self.read_queue.push_back(bytes);
    }

    /// Install a device model: every confirmed write is decoded and handed
    /// to the closure; returned bytes are queued as the response.
    pub(crate) fn respond_with<F>(&mut self, responder: F)
    where
        F: FnMut(&CommandFrame) -> Option<Vec<u8>> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
    }

    /// Make the next `raw_write` calls fail with the given errors, in order.
    pub(crate) fn fail_next_write(&mut self, err: TransportError) {
        self.fail_writes.push_back(err);
    }

    /// Enable the transport-native bulk download path. `progress` is the
    /// percent sequence emitted during each download; returns a handle to
    /// the download log.
    pub(crate) fn support_native_download(&mut self, progress: Vec<u8>) -> NativeLog {
        let log = NativeLog::default();
        self.native = Some(NativeScript {
            progress,
            log: Arc::clone(&log),
        });
        log
    }

    fn scripted_download(
        &mut self,
        bootloader: bool,
        image: &[u8],
        progress: NativeProgress<'_>,
    ) -> Result<(), TransportError> {
        match self.native.as_mut() {
            Some(script) => {
                script.log.lock().unwrap().push((bootloader, image.len()));
                for &percent in &script.progress {
                    progress(percent);
                }
                Ok(())
            },
            None => Err(TransportError::Unsupported("native download".into())),
        }
    }
}

/// Response bytes: bare success status for `opcode`.
pub(crate) fn ok_frame(opcode: frame::Opcode) -> Vec<u8> {
    frame::encode(opcode, &[STATUS_OK]).to_bytes()
}

/// Response bytes: success status plus result data.
pub(crate) fn data_frame(opcode: frame::Opcode, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + data.len());
    payload.push(STATUS_OK);
    payload.extend_from_slice(data);
    frame::encode(opcode, &payload).to_bytes()
}

/// Response bytes: command still executing.
pub(crate) fn busy_frame(opcode: frame::Opcode) -> Vec<u8> {
    frame::encode(opcode, &[STATUS_BUSY]).to_bytes()
}

/// Response bytes: device-side execution error.
pub(crate) fn device_error_frame(opcode: frame::Opcode, code: u8) -> Vec<u8> {
    frame::encode(opcode, &[code]).to_bytes()
}

impl Transport for MockTransport {
    fn open(&mut self, _descriptor: &NodeDescriptor) -> Result<(), TransportError> {
        self.state = TransportState::Open;
        Ok(())
    }

    fn initialize(&mut self, _params: &InitParams) -> Result<(), TransportError> {
        self.state = TransportState::Initialized;
        Ok(())
    }

    fn raw_read(&mut self, _param: &IoParam, buf: &mut [u8]) -> Result<usize, TransportError> {
        let Some(mut chunk) = self.read_queue.pop_front() else {
            return Err(TransportError::TimedOut("no scripted data".into()));
        };
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.read_queue.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn raw_write(&mut self, _param: &IoParam, data: &[u8]) -> Result<(), TransportError> {
        if let Some(err) = self.fail_writes.pop_front() {
            return Err(err);
        }
        let frame = frame::decode(data).expect("engine must emit well-formed frames");
        if let Some(responder) = self.responder.as_mut() {
            if let Some(response) = responder(&frame) {
                self.read_queue.push_back(response);
            }
        }
        self.written.lock().unwrap().push(frame);
        Ok(())
    }

    fn write_without_confirmation(
        &mut self,
        _param: &IoParam,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if let Some(err) = self.fail_writes.pop_front() {
            return Err(err);
        }
        let frame = frame::decode(data).expect("engine must emit well-formed frames");
        self.unconfirmed.lock().unwrap().push(frame);
        Ok(())
    }

    fn detect_device_mode(&mut self) -> Result<DeviceMode, TransportError> {
        Ok(self.device_mode)
    }

    fn channel_kind(&self) -> ChannelKind {
        self.kind
    }

    fn download_firmware(
        &mut self,
        image: &[u8],
        progress: NativeProgress<'_>,
    ) -> Result<(), TransportError> {
        self.scripted_download(false, image, progress)
    }

    fn download_bootloader(
        &mut self,
        image: &[u8],
        progress: NativeProgress<'_>,
    ) -> Result<(), TransportError> {
        self.scripted_download(true, image, progress)
    }

    fn release(&mut self, _params: &InitParams) -> Result<(), TransportError> {
        self.state = TransportState::Open;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state = TransportState::Closed;
        Ok(())
    }
}
