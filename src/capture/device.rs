//! Interface to the device-control client exposing a remote camera.
//!
//! The relay never talks to camera hardware directly. A device backend
//! implements [`DeviceConnector`] and hands out [`DeviceClient`]s; the typed
//! [`CameraDevice`] wrapper reads the handful of attributes the relay needs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn};

use crate::capture::frame::PixelFormat;
use crate::error::{DeviceError, SourceError};

pub const ATTR_LAST_IMAGE: &str = "video_last_image";
pub const ATTR_LAST_IMAGE_COUNTER: &str = "video_last_image_counter";
pub const ATTR_LIVE: &str = "video_live";
pub const ATTR_VIDEO_MODE: &str = "video_mode";
pub const ATTR_WIDTH: &str = "image_width";
pub const ATTR_HEIGHT: &str = "image_height";

/// Attribute value as exchanged with a device.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Bytes),
}

/// Connection to one remote camera device.
pub trait DeviceClient: Send + Sync {
    /// Round-trip to the device; returns the measured latency.
    fn ping(&self) -> Result<Duration, DeviceError>;

    fn read_attribute(&self, name: &str) -> Result<AttrValue, DeviceError>;

    fn write_attribute(&self, name: &str, value: AttrValue) -> Result<(), DeviceError>;
}

/// Resolves a device URI into a client.
pub trait DeviceConnector: Send + Sync {
    fn connect(&self, uri: &str) -> Result<Box<dyn DeviceClient>, DeviceError>;
}

/// Typed view of a connected camera device.
pub struct CameraDevice {
    uri: String,
    client: Box<dyn DeviceClient>,
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl CameraDevice {
    /// Connect, ping, and read the native geometry of the camera.
    pub fn connect(connector: &dyn DeviceConnector, uri: &str) -> Result<Self, SourceError> {
        info!("Connecting to {}", uri);

        let connect_err = |source| SourceError::Connect {
            uri: uri.to_string(),
            source,
        };

        let client = connector.connect(uri).map_err(connect_err)?;
        let latency = client.ping().map_err(connect_err)?;

        let mode = read_str(client.as_ref(), ATTR_VIDEO_MODE).map_err(connect_err)?;
        let format = PixelFormat::from_video_mode(&mode).ok_or_else(|| SourceError::VideoMode {
            uri: uri.to_string(),
            mode: mode.clone(),
        })?;
        let width = read_dim(client.as_ref(), ATTR_WIDTH).map_err(connect_err)?;
        let height = read_dim(client.as_ref(), ATTR_HEIGHT).map_err(connect_err)?;

        info!(
            "Connected to {} ({}x{} {}, ping {:?})",
            uri, width, height, format, latency
        );

        Ok(Self {
            uri: uri.to_string(),
            client,
            format,
            width,
            height,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn last_image_counter(&self) -> Result<i64, SourceError> {
        match self.read(ATTR_LAST_IMAGE_COUNTER)? {
            AttrValue::Int(counter) => Ok(counter),
            _ => Err(self.type_error(ATTR_LAST_IMAGE_COUNTER, "int")),
        }
    }

    /// Header-prefixed raw buffer of the latest frame.
    pub fn last_image(&self) -> Result<Bytes, SourceError> {
        match self.read(ATTR_LAST_IMAGE)? {
            AttrValue::Bytes(buf) => Ok(buf),
            _ => Err(self.type_error(ATTR_LAST_IMAGE, "bytes")),
        }
    }

    pub fn is_live(&self) -> Result<bool, SourceError> {
        match self.read(ATTR_LIVE)? {
            AttrValue::Bool(live) => Ok(live),
            _ => Err(self.type_error(ATTR_LIVE, "bool")),
        }
    }

    pub fn set_live(&self, live: bool) -> Result<(), SourceError> {
        self.client
            .write_attribute(ATTR_LIVE, AttrValue::Bool(live))
            .map_err(|source| SourceError::Device {
                uri: self.uri.clone(),
                source,
            })
    }

    fn read(&self, name: &str) -> Result<AttrValue, SourceError> {
        self.client
            .read_attribute(name)
            .map_err(|source| SourceError::Device {
                uri: self.uri.clone(),
                source,
            })
    }

    fn type_error(&self, name: &str, expected: &'static str) -> SourceError {
        warn!("{} reported a non-{} {}", self.uri, expected, name);
        SourceError::Device {
            uri: self.uri.clone(),
            source: DeviceError::AttributeType {
                name: name.to_string(),
                expected,
            },
        }
    }
}

fn read_str(client: &dyn DeviceClient, name: &str) -> Result<String, DeviceError> {
    match client.read_attribute(name)? {
        AttrValue::Str(s) => Ok(s),
        _ => Err(DeviceError::AttributeType {
            name: name.to_string(),
            expected: "string",
        }),
    }
}

fn read_dim(client: &dyn DeviceClient, name: &str) -> Result<u32, DeviceError> {
    match client.read_attribute(name)? {
        AttrValue::Int(v) if v > 0 && v <= u32::MAX as i64 => Ok(v as u32),
        _ => Err(DeviceError::AttributeType {
            name: name.to_string(),
            expected: "positive int",
        }),
    }
}

/// Shared connector handle passed down to producers.
pub type SharedConnector = Arc<dyn DeviceConnector>;
