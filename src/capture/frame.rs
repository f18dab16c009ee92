use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::CameraConfig;

/// Raw frame as handed from a source to the frame channel.
///
/// The buffer carries no source identity; geometry comes from the
/// [`SourceDescriptor`] of the camera that produced it.
#[derive(Clone)]
pub struct RawFrame {
    /// Pixel payload with the hardware header already stripped
    pub data: Bytes,

    /// Monotonic per-source frame counter
    pub sequence: u64,

    /// Poll timestamp for latency tracking
    pub timestamp: Instant,
}

impl RawFrame {
    pub fn new(data: impl Into<Bytes>, sequence: u64) -> Self {
        Self {
            data: data.into(),
            sequence,
            timestamp: Instant::now(),
        }
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("len", &self.data.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    #[serde(rename = "RGB24")]
    Rgb24,
    #[serde(rename = "Y8")]
    Y8,
    /// Already-encoded JPEG, relayed verbatim
    #[serde(rename = "JPEG")]
    Jpeg,
}

impl PixelFormat {
    /// Parse the `video_mode` attribute reported by a camera device.
    pub fn from_video_mode(mode: &str) -> Option<Self> {
        match mode {
            "RGB24" => Some(PixelFormat::Rgb24),
            "Y8" => Some(PixelFormat::Y8),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Y8 => Some(1),
            PixelFormat::Jpeg => None,
        }
    }

    /// Image mode name as used in logs ("RGB", "L").
    pub fn image_mode(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB",
            PixelFormat::Y8 => "L",
            PixelFormat::Jpeg => "JPEG",
        }
    }

    /// Pixel format name understood by the MPEG1 encoder.
    pub fn encoder_name(self) -> Option<&'static str> {
        match self {
            PixelFormat::Rgb24 => Some("rgb24"),
            PixelFormat::Y8 => Some("gray"),
            PixelFormat::Jpeg => None,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Y8 => "Y8",
            PixelFormat::Jpeg => "JPEG",
        };
        f.write_str(name)
    }
}

/// Per-camera transform parameters. Zero sizes disable a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transform {
    pub crop: (u32, u32),
    pub resize: (u32, u32),
    /// Counter-clockwise degrees; anything but 0/90/180/270 is ignored
    pub rotate: i32,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl Transform {
    pub fn from_config(camera: &CameraConfig) -> Self {
        Self {
            crop: (camera.crop[0], camera.crop[1]),
            resize: (camera.resize[0], camera.resize[1]),
            rotate: camera.rotate,
            flip_horizontal: camera.flip[0],
            flip_vertical: camera.flip[1],
        }
    }
}

/// Static facts about one camera, fixed at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub transform: Transform,
    /// Configured exposure time; poll and stream intervals derive from it
    pub exposure: Duration,
}

impl SourceDescriptor {
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Expected raw buffer length, or `None` for encoded formats.
    pub fn frame_len(&self) -> Option<usize> {
        self.format
            .bytes_per_pixel()
            .map(|bpp| self.width as usize * self.height as usize * bpp)
    }

    /// Sleep between hardware polls: half the exposure time.
    pub fn poll_interval(&self) -> Duration {
        self.exposure / 2
    }

    /// Sleep after a delivered frame in the dual multiplexer: slightly under
    /// the exposure time so the source is polled again just before its next
    /// frame is due.
    pub fn frame_interval(&self) -> Duration {
        self.exposure * 9 / 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(width: u32, height: u32, format: PixelFormat) -> SourceDescriptor {
        SourceDescriptor {
            uri: "sim://cam".into(),
            width,
            height,
            format,
            transform: Transform::default(),
            exposure: Duration::from_millis(50),
        }
    }

    #[test]
    fn frame_len_follows_format() {
        assert_eq!(
            descriptor(640, 480, PixelFormat::Rgb24).frame_len(),
            Some(921_600)
        );
        assert_eq!(
            descriptor(320, 240, PixelFormat::Y8).frame_len(),
            Some(76_800)
        );
        assert_eq!(descriptor(320, 240, PixelFormat::Jpeg).frame_len(), None);
    }

    #[test]
    fn video_mode_names() {
        assert_eq!(PixelFormat::from_video_mode("Y8"), Some(PixelFormat::Y8));
        assert_eq!(
            PixelFormat::from_video_mode("RGB24"),
            Some(PixelFormat::Rgb24)
        );
        assert_eq!(PixelFormat::from_video_mode("BAYER_RG16"), None);
        assert_eq!(PixelFormat::Y8.image_mode(), "L");
    }

    #[test]
    fn intervals_scale_with_exposure() {
        let d = descriptor(8, 8, PixelFormat::Y8);
        assert_eq!(d.poll_interval(), Duration::from_millis(25));
        assert!(d.frame_interval() < d.exposure);
        assert!(d.frame_interval() > d.poll_interval());
    }
}
