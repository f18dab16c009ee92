//! Error taxonomy for the relay pipeline.
//!
//! Per-frame errors (`HeaderError`, `FrameError`, `RenderError`) never leave
//! the polling or streaming loops; they are logged and the frame is skipped.
//! `SourceError::Connect` on the mandatory primary source is the only error
//! that is allowed to end the process.

use std::time::Duration;

use thiserror::Error;

/// Failures decoding the binary prefix of a raw frame buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("malformed header: buffer is {len} bytes, header needs {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("malformed header: non-positive geometry {width}x{height}")]
    BadGeometry { width: i32, height: i32 },

    #[error("malformed header: negative frame sequence {0}")]
    BadSequence(i64),

    #[error("malformed frame: payload is {len} bytes, header geometry needs {expected}")]
    PayloadSize { len: usize, expected: usize },

    #[error("frame sequence {0} does not fit the header's i64 field")]
    SequenceRange(u64),

    #[error("geometry {width}x{height} does not fit the header's positive i32 fields")]
    GeometryRange { width: u32, height: u32 },
}

/// Failures attributing a raw buffer to the camera that produced it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("ambiguous frame: {len} bytes matches both primary and secondary layouts")]
    Ambiguous { len: usize },

    #[error("frame of {len} bytes matches no configured camera layout")]
    UnknownLayout { len: usize },
}

/// Errors reported by a device-control client.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {uri} unreachable: {reason}")]
    Unreachable { uri: String, reason: String },

    #[error("attribute {name} not available")]
    MissingAttribute { name: String },

    #[error("attribute {name} has unexpected type, expected {expected}")]
    AttributeType { name: String, expected: &'static str },

    #[error("attribute {name} is read-only")]
    ReadOnly { name: String },

    #[error("no device backend can handle {0}")]
    NoBackend(String),
}

/// Errors raised by frame sources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Construction-time connect/ping failure. Fatal for the primary camera.
    #[error("failed to connect to {uri}")]
    Connect {
        uri: String,
        #[source]
        source: DeviceError,
    },

    #[error("read from {uri} failed")]
    Device {
        uri: String,
        #[source]
        source: DeviceError,
    },

    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("unsupported video mode {mode:?} on {uri}")]
    VideoMode { uri: String, mode: String },

    #[error("network stream {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("unsupported source uri {0:?}")]
    Unsupported(String),
}

impl SourceError {
    pub fn is_connect(&self) -> bool {
        matches!(self, SourceError::Connect { .. })
    }
}

/// Failures inside the image transform pipeline.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("buffer of {len} bytes does not hold a {width}x{height} {format} image")]
    BufferSize {
        len: usize,
        width: u32,
        height: u32,
        format: &'static str,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("jpeg encode failed")]
    Encode(#[from] image::ImageError),
}

/// Failures handing a frame to a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,

    #[error("sink write failed")]
    Io(#[from] std::io::Error),
}

/// Failures of the external MPEG1 encoder process.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to spawn encoder {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder stdin unavailable")]
    NoStdin,

    #[error("encoder cannot take {0} input")]
    Format(String),

    #[error("encoder producer could not start")]
    Producer(#[source] std::io::Error),

    #[error("encoder source unavailable")]
    Source(#[from] SourceError),

    #[error("encoder exited unexpectedly ({status})")]
    ProcessFailure { status: String },
}

/// Why a polling producer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerExit {
    /// Explicit stop from the session manager.
    Stopped,
    /// No consumer drained the channel for longer than the idle threshold.
    IdleTimeout(Duration),
    /// The sink refused frames (consumer side gone, encoder pipe broken).
    SinkClosed,
    /// The source could not be opened inside the producer.
    ConnectFailed(String),
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}
