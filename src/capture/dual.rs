//! Dual-camera multiplexer.
//!
//! Two independently clocked cameras share one producer. Each cycle the
//! multiplexer picks the live camera (primary first), pulls its frame when the
//! camera's counter moved, and paces itself on that camera's exposure time.
//!
//! Raw buffers carry no camera id. Downstream attributes a buffer by its
//! length against each camera's `width * height * bytes_per_pixel`. Two
//! cameras with the same frame length cannot be told apart; such frames are
//! rejected as ambiguous instead of being guessed.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::capture::device::{CameraDevice, DeviceConnector};
use crate::capture::frame::{PixelFormat, RawFrame, SourceDescriptor};
use crate::capture::source::{describe, fetch_if_new, FrameSource};
use crate::error::{FrameError, SourceError};
use crate::CameraConfig;

/// Sleep while no camera is live.
const NO_LIVE_CAMERA_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Camera {
    Primary,
    Secondary,
}

impl Camera {
    fn index(self) -> usize {
        match self {
            Camera::Primary => 0,
            Camera::Secondary => 1,
        }
    }
}

impl std::fmt::Display for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Camera::Primary => f.write_str("primary"),
            Camera::Secondary => f.write_str("secondary"),
        }
    }
}

/// Geometry of the camera(s) feeding one frame channel.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameLayout {
    primary: SourceDescriptor,
    secondary: Option<SourceDescriptor>,
}

impl FrameLayout {
    pub fn single(descriptor: SourceDescriptor) -> Self {
        Self {
            primary: descriptor,
            secondary: None,
        }
    }

    pub fn dual(primary: SourceDescriptor, secondary: Option<SourceDescriptor>) -> Self {
        if let Some(secondary) = &secondary {
            if primary.frame_len() == secondary.frame_len() {
                warn!(
                    "{} and {} both produce {:?}-byte frames; their frames will be rejected as ambiguous",
                    primary.uri,
                    secondary.uri,
                    primary.frame_len()
                );
            }
        }
        Self { primary, secondary }
    }

    pub fn primary(&self) -> &SourceDescriptor {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&SourceDescriptor> {
        self.secondary.as_ref()
    }

    /// Attribute a raw buffer of `len` bytes to the camera that produced it.
    pub fn attribute(&self, len: usize) -> Result<&SourceDescriptor, FrameError> {
        let Some(secondary) = &self.secondary else {
            return Ok(&self.primary);
        };

        let is_primary = self.primary.frame_len() == Some(len);
        let is_secondary = secondary.frame_len() == Some(len);
        match (is_primary, is_secondary) {
            (true, true) => Err(FrameError::Ambiguous { len }),
            (true, false) => Ok(&self.primary),
            (false, true) => Ok(secondary),
            (false, false) => Err(FrameError::UnknownLayout { len }),
        }
    }
}

pub struct DualSource {
    devices: [Option<CameraDevice>; 2],
    layout: FrameLayout,
    selected: Option<Camera>,
    last_counter: [Option<i64>; 2],
    next_delay: Duration,
}

impl DualSource {
    /// Connect both cameras. The primary is mandatory; a secondary that cannot
    /// be reached is logged and left out.
    pub fn connect(
        primary: &CameraConfig,
        secondary: Option<&CameraConfig>,
        connector: &dyn DeviceConnector,
    ) -> Result<Self, SourceError> {
        let primary_device = CameraDevice::connect(connector, &primary.uri)?;
        let primary_desc = describe(primary, &primary_device);

        let (secondary_device, secondary_desc) = match secondary.filter(|c| !c.uri.is_empty()) {
            Some(camera) => match CameraDevice::connect(connector, &camera.uri) {
                Ok(device) => {
                    let desc = describe(camera, &device);
                    (Some(device), Some(desc))
                }
                Err(e) => {
                    error!("Secondary camera {} unavailable: {}", camera.uri, e);
                    (None, None)
                }
            },
            None => (None, None),
        };

        let next_delay = primary_desc.poll_interval();
        let mut source = Self {
            devices: [Some(primary_device), secondary_device],
            layout: FrameLayout::dual(primary_desc, secondary_desc),
            selected: None,
            last_counter: [None, None],
            next_delay,
        };
        source.selected = source.select().unwrap_or(None);
        if let Some(camera) = source.selected {
            info!("Streaming from {} camera {}", camera, source.descriptor(camera).uri);
        }
        Ok(source)
    }

    pub fn selected(&self) -> Option<Camera> {
        self.selected
    }

    fn device(&self, camera: Camera) -> Option<&CameraDevice> {
        self.devices[camera.index()].as_ref()
    }

    fn descriptor(&self, camera: Camera) -> &SourceDescriptor {
        match camera {
            Camera::Primary => self.layout.primary(),
            Camera::Secondary => self.layout.secondary().unwrap_or(self.layout.primary()),
        }
    }

    /// Primary wins if live, else the secondary if live, else nothing.
    fn select(&self) -> Result<Option<Camera>, SourceError> {
        for camera in [Camera::Primary, Camera::Secondary] {
            if let Some(device) = self.device(camera) {
                if device.is_live()? {
                    return Ok(Some(camera));
                }
            }
        }
        Ok(None)
    }
}

impl FrameSource for DualSource {
    fn poll_once(&mut self) -> Result<Option<RawFrame>, SourceError> {
        let selection = match self.select() {
            Ok(selection) => selection,
            Err(e) => {
                self.next_delay = self.layout.primary().poll_interval();
                return Err(e);
            }
        };

        if selection != self.selected {
            match selection {
                Some(camera) => info!("Streaming from {} camera {}", camera, self.descriptor(camera).uri),
                None => info!("No camera is live, pausing"),
            }
            self.selected = selection;
        }

        let Some(camera) = selection else {
            self.next_delay = NO_LIVE_CAMERA_SLEEP;
            return Ok(None);
        };

        let descriptor = self.descriptor(camera).clone();
        self.next_delay = descriptor.poll_interval();

        let Some(device) = self.devices[camera.index()].as_ref() else {
            return Ok(None);
        };
        let frame = fetch_if_new(device, &mut self.last_counter[camera.index()])?;
        if frame.is_some() {
            self.next_delay = descriptor.frame_interval();
        }
        Ok(frame)
    }

    fn native_size(&self) -> (u32, u32) {
        self.descriptor(self.selected.unwrap_or(Camera::Primary)).size()
    }

    fn native_format(&self) -> PixelFormat {
        self.descriptor(self.selected.unwrap_or(Camera::Primary)).format
    }

    fn layout(&self) -> FrameLayout {
        self.layout.clone()
    }

    fn next_poll_delay(&self) -> Duration {
        self.next_delay
    }

    fn is_live(&self) -> bool {
        self.selected.is_some()
    }
}
