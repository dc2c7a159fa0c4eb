//! Device lifecycle status tracking.
//!
//! The module reports its lifecycle through a one-byte status query. A
//! [`StatusManager`] caches the last reported status per channel so callers
//! can gate operations (previews, upgrades) without re-querying the device
//! on every check.

use crate::channel::CommandChannel;
use crate::error::Result;
use crate::protocol::frame::Opcode;
use crate::transport::ChannelKind;
use log::{debug, warn};

/// Device lifecycle status as reported by the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceStatus {
    /// Booting; not ready for commands beyond the status query itself.
    Startup,
    /// Idle and ready, no video stream active.
    Preview,
    /// Actively streaming video frames.
    VideoStreaming,
    /// A firmware or bootloader transfer is in progress.
    UpgradeInProgress,
    /// The device reported a fault, or an unrecognized status byte arrived.
    Error,
}

impl DeviceStatus {
    /// Map the raw status byte. Unrecognized values are treated as a device
    /// fault rather than rejected, so a newer device never bricks an older
    /// host.
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Startup,
            1 => Self::Preview,
            2 => Self::VideoStreaming,
            3 => Self::UpgradeInProgress,
            4 => Self::Error,
            other => {
                warn!("unrecognized device status byte {other:#04x}, treating as error");
                Self::Error
            },
        }
    }

    /// Whether ordinary commands may be issued in this status.
    #[must_use]
    pub fn accepts_commands(&self) -> bool {
        matches!(self, Self::Preview | Self::VideoStreaming)
    }
}

/// Cached view of one channel's device status.
#[derive(Debug)]
pub struct StatusManager {
    channel_kind: ChannelKind,
    last_status: Option<DeviceStatus>,
}

impl StatusManager {
    /// Create an empty manager for `channel_kind`. No status is known until
    /// the first [`refresh`](Self::refresh).
    #[must_use]
    pub fn new(channel_kind: ChannelKind) -> Self {
        Self {
            channel_kind,
            last_status: None,
        }
    }

    /// The channel this manager tracks.
    #[must_use]
    pub fn channel_kind(&self) -> ChannelKind {
        self.channel_kind
    }

    /// Last status observed, if any query has succeeded yet.
    #[must_use]
    pub fn last_status(&self) -> Option<DeviceStatus> {
        self.last_status
    }

    /// Query the device and update the cache.
    ///
    /// On failure the cached value is left untouched, so a transient query
    /// error never erases the last known good status.
    pub fn refresh(&mut self, channel: &mut CommandChannel) -> Result<DeviceStatus> {
        let data = channel.query(Opcode::DEVICE_STATUS, &[])?;
        let status = match data.first() {
            Some(&raw) => DeviceStatus::from_raw(raw),
            // Success status with no data byte: the device answered but said
            // nothing usable.
            None => DeviceStatus::Error,
        };
        debug!("{} device status: {status:?}", self.channel_kind);
        self.last_status = Some(status);
        Ok(status)
    }
}
