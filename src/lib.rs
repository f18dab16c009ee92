pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod web;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use capture::{PixelFormat, RawFrame};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub primary: CameraConfig,
    pub secondary: Option<CameraConfig>,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path suffix for the stream endpoints (`/video/<hash>`, `/ws/<hash>`)
    pub hash: String,
    pub boundary: String,
    pub max_concurrent_streams: usize,
    /// How long a shutdown waits for open streams before forcing exit
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "MJPEG")]
    Mjpeg,
    #[serde(rename = "MJPEGDUO")]
    MjpegDuo,
    #[serde(rename = "MPEG1")]
    Mpeg1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub format: OutputFormat,
    /// JPEG quality, 1..=100
    pub quality: u8,
    /// Producers with no consumer activity for this long stop themselves
    pub idle_timeout_secs: u64,
}

/// Per-camera settings. Zero sizes disable resize/crop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub uri: String,
    /// Expected exposure time in seconds
    pub exposure_time: f64,
    pub resize: [u32; 2],
    pub crop: [u32; 2],
    pub rotate: i32,
    /// [horizontal, vertical]
    pub flip: [bool; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub program: String,
    /// Passed to the encoder as `-q:v`
    pub quality: u32,
    /// Output scaling; [0, 0] keeps the source size
    pub size: [u32; 2],
    /// Forward encoder stderr instead of discarding it
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            hash: String::new(),
            boundary: "frame".into(),
            max_concurrent_streams: 2,
            shutdown_grace_ms: 1000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Mjpeg,
            quality: 90,
            idle_timeout_secs: 60,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            uri: "test".into(),
            exposure_time: 0.05,
            resize: [0, 0],
            crop: [0, 0],
            rotate: 0,
            flip: [false, false],
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            quality: 4,
            size: [0, 0],
            debug: false,
        }
    }
}

impl CameraConfig {
    pub fn exposure(&self) -> Duration {
        Duration::from_secs_f64(self.exposure_time)
    }

    pub fn is_network(&self) -> bool {
        self.uri.starts_with("http://") || self.uri.starts_with("https://")
    }
}

impl StreamConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    /// Load configuration from an optional TOML file, overridden by
    /// `CAMRELAY__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("CAMRELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    ///
    /// Rotation angles are deliberately not checked here; unsupported angles
    /// are ignored when rendering.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.server.port == 0 {
            return invalid("server.port must be non-zero".into());
        }
        if self.server.max_concurrent_streams == 0 {
            return invalid("server.max_concurrent_streams must be at least 1".into());
        }
        if !self
            .server
            .hash
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return invalid(format!(
                "server.hash {:?} may only contain [A-Za-z0-9_-]",
                self.server.hash
            ));
        }
        if self.server.boundary.is_empty() || self.server.boundary.contains(['"', '\r', '\n']) {
            return invalid(format!("server.boundary {:?} is not a valid token", self.server.boundary));
        }
        if !(1..=100).contains(&self.stream.quality) {
            return invalid(format!("stream.quality {} outside 1..=100", self.stream.quality));
        }
        if self.stream.idle_timeout_secs == 0 {
            return invalid("stream.idle_timeout_secs must be at least 1".into());
        }

        let cameras = std::iter::once(("primary", &self.primary))
            .chain(self.secondary.iter().map(|c| ("secondary", c)));
        for (name, camera) in cameras {
            if camera.uri.is_empty() {
                return invalid(format!("{}.uri must be set", name));
            }
            if !(camera.exposure_time.is_finite() && camera.exposure_time > 0.0) {
                return invalid(format!(
                    "{}.exposure_time {} must be positive",
                    name, camera.exposure_time
                ));
            }
        }

        match self.stream.format {
            OutputFormat::MjpegDuo => {
                let network = self.primary.is_network()
                    || self.secondary.as_ref().is_some_and(|c| c.is_network());
                if network || self.primary.uri == "test" {
                    return invalid("MJPEGDUO requires device cameras".into());
                }
            }
            OutputFormat::Mpeg1 => {
                if self.primary.is_network() {
                    return invalid("MPEG1 cannot transcode an MJPEG network source".into());
                }
                if self.encoder.program.is_empty() {
                    return invalid("encoder.program must be set for MPEG1".into());
                }
            }
            OutputFormat::Mjpeg => {}
        }

        Ok(())
    }

    /// Public path of the live stream for the configured format.
    pub fn stream_path(&self) -> String {
        match self.stream.format {
            OutputFormat::Mpeg1 => format!("/ws/{}", self.server.hash),
            _ => format!("/video/{}", self.server.hash),
        }
    }
}
