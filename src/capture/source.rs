//! Frame sources polled by the producer loop.

use std::time::Duration;

use tracing::{debug, info};

use crate::capture::device::{CameraDevice, DeviceConnector};
use crate::capture::dual::{DualSource, FrameLayout};
use crate::capture::frame::{PixelFormat, RawFrame, SourceDescriptor, Transform};
use crate::capture::header::FrameHeader;
use crate::capture::mjpeg::MjpegSource;
use crate::error::{HeaderError, SourceError};
use crate::{CameraConfig, Config, OutputFormat};

/// Fixed period of the synthetic source.
const TEST_PERIOD: Duration = Duration::from_millis(50);
const TEST_SIZE: (u32, u32) = (640, 480);

/// Anything that can be polled for its latest frame.
pub trait FrameSource: Send {
    /// One poll attempt. `Ok(None)` means nothing new this cycle.
    fn poll_once(&mut self) -> Result<Option<RawFrame>, SourceError>;

    fn native_size(&self) -> (u32, u32);

    fn native_format(&self) -> PixelFormat;

    /// Geometry needed downstream to decode this source's buffers.
    fn layout(&self) -> FrameLayout;

    /// Sleep to observe before the next poll, given the last poll's outcome.
    fn next_poll_delay(&self) -> Duration;

    /// Whether any camera behind the source is currently streaming.
    fn is_live(&self) -> bool {
        true
    }
}

/// Open the source configured for `config.stream.format`.
pub fn open_source(
    config: &Config,
    connector: &dyn DeviceConnector,
) -> Result<Box<dyn FrameSource>, SourceError> {
    match config.stream.format {
        OutputFormat::MjpegDuo => Ok(Box::new(DualSource::connect(
            &config.primary,
            config.secondary.as_ref(),
            connector,
        )?)),
        OutputFormat::Mjpeg | OutputFormat::Mpeg1 => open_single(&config.primary, connector),
    }
}

/// Open one camera, choosing the variant from the URI.
pub fn open_single(
    camera: &CameraConfig,
    connector: &dyn DeviceConnector,
) -> Result<Box<dyn FrameSource>, SourceError> {
    if camera.uri == "test" {
        return Ok(Box::new(TestSource::new(camera)));
    }
    if camera.is_network() {
        return Ok(Box::new(MjpegSource::new(camera)));
    }
    Ok(Box::new(HardwareSource::connect(camera, connector)?))
}

/// Build the descriptor of a connected device camera.
pub fn describe(camera: &CameraConfig, device: &CameraDevice) -> SourceDescriptor {
    let (width, height) = device.size();
    SourceDescriptor {
        uri: camera.uri.clone(),
        width,
        height,
        format: device.format(),
        transform: Transform::from_config(camera),
        exposure: camera.exposure(),
    }
}

/// Fetch and decode the device's latest frame if its counter moved since
/// `last_counter`. Only the counter is transferred when the camera is idle.
pub(crate) fn fetch_if_new(
    device: &CameraDevice,
    last_counter: &mut Option<i64>,
) -> Result<Option<RawFrame>, SourceError> {
    let counter = device.last_image_counter()?;
    if *last_counter == Some(counter) {
        return Ok(None);
    }

    let buf = device.last_image()?;
    let (header, payload) = FrameHeader::split(&buf)?;
    if let Some(bpp) = device.format().bytes_per_pixel() {
        let expected = header.payload_len(bpp);
        if payload.len() != expected {
            return Err(HeaderError::PayloadSize {
                len: payload.len(),
                expected,
            }
            .into());
        }
    }
    *last_counter = Some(counter);

    debug!(
        "{}: frame {} ({}x{}, {} bytes)",
        device.uri(),
        header.sequence,
        header.width,
        header.height,
        payload.len()
    );
    metrics::counter!("frames_polled").increment(1);

    Ok(Some(RawFrame::new(
        buf.slice(FrameHeader::PAYLOAD_OFFSET..),
        header.sequence,
    )))
}

/// Synthetic source replaying one pre-built frame for smoke tests.
pub struct TestSource {
    descriptor: SourceDescriptor,
    pattern: bytes::Bytes,
    sequence: u64,
}

impl TestSource {
    pub fn new(camera: &CameraConfig) -> Self {
        let (width, height) = TEST_SIZE;
        let mut pattern = Vec::with_capacity((width * height * 3) as usize);
        // Eight vertical colour bars
        const BARS: [[u8; 3]; 8] = [
            [255, 255, 255],
            [255, 255, 0],
            [0, 255, 255],
            [0, 255, 0],
            [255, 0, 255],
            [255, 0, 0],
            [0, 0, 255],
            [0, 0, 0],
        ];
        for _ in 0..height {
            for x in 0..width {
                pattern.extend_from_slice(&BARS[(x * 8 / width) as usize]);
            }
        }

        Self {
            descriptor: SourceDescriptor {
                uri: camera.uri.clone(),
                width,
                height,
                format: PixelFormat::Rgb24,
                transform: Transform::from_config(camera),
                exposure: TEST_PERIOD,
            },
            pattern: pattern.into(),
            sequence: 0,
        }
    }
}

impl FrameSource for TestSource {
    fn poll_once(&mut self) -> Result<Option<RawFrame>, SourceError> {
        self.sequence += 1;
        Ok(Some(RawFrame::new(self.pattern.clone(), self.sequence)))
    }

    fn native_size(&self) -> (u32, u32) {
        self.descriptor.size()
    }

    fn native_format(&self) -> PixelFormat {
        self.descriptor.format
    }

    fn layout(&self) -> FrameLayout {
        FrameLayout::single(self.descriptor.clone())
    }

    fn next_poll_delay(&self) -> Duration {
        TEST_PERIOD
    }
}

/// One remote camera reached through the device-control client.
pub struct HardwareSource {
    device: CameraDevice,
    descriptor: SourceDescriptor,
    last_counter: Option<i64>,
}

impl HardwareSource {
    /// Connect and ping the camera. A failure here is a `ConnectError`; the
    /// caller decides whether it is fatal.
    pub fn connect(
        camera: &CameraConfig,
        connector: &dyn DeviceConnector,
    ) -> Result<Self, SourceError> {
        let device = CameraDevice::connect(connector, &camera.uri)?;
        let descriptor = describe(camera, &device);
        info!(
            "Hardware source {} ready ({}x{} {})",
            descriptor.uri, descriptor.width, descriptor.height, descriptor.format
        );
        Ok(Self {
            device,
            descriptor,
            last_counter: None,
        })
    }
}

impl FrameSource for HardwareSource {
    fn poll_once(&mut self) -> Result<Option<RawFrame>, SourceError> {
        fetch_if_new(&self.device, &mut self.last_counter)
    }

    fn native_size(&self) -> (u32, u32) {
        self.descriptor.size()
    }

    fn native_format(&self) -> PixelFormat {
        self.descriptor.format
    }

    fn layout(&self) -> FrameLayout {
        FrameLayout::single(self.descriptor.clone())
    }

    fn next_poll_delay(&self) -> Duration {
        self.descriptor.poll_interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{SimulatedConnector, SimulatedDevice};

    fn camera(uri: &str) -> CameraConfig {
        CameraConfig {
            uri: uri.into(),
            ..CameraConfig::default()
        }
    }

    #[test]
    fn test_source_repeats_pattern_with_rising_sequence() {
        let mut source = TestSource::new(&camera("test"));
        let a = source.poll_once().unwrap().unwrap();
        let b = source.poll_once().unwrap().unwrap();
        assert_eq!(a.data, b.data);
        assert_eq!(a.data.len(), 640 * 480 * 3);
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn hardware_source_fetches_only_on_counter_change() {
        let connector = SimulatedConnector::new();
        let device = connector.insert(SimulatedDevice::new("cam/1", 4, 4, PixelFormat::Y8));
        let mut source = HardwareSource::connect(&camera("cam/1"), &connector).unwrap();

        let first = source.poll_once().unwrap().expect("first poll delivers");
        assert_eq!(first.data.len(), 16);
        assert!(source.poll_once().unwrap().is_none());

        device.advance();
        let next = source.poll_once().unwrap().expect("counter moved");
        assert_eq!(next.sequence, 1);
        assert!(source.poll_once().unwrap().is_none());
    }

    #[test]
    fn hardware_source_connect_failure_is_connect_error() {
        let connector = SimulatedConnector::new();
        let device = connector.insert(SimulatedDevice::new("cam/1", 4, 4, PixelFormat::Y8));
        device.set_reachable(false);
        let err = HardwareSource::connect(&camera("cam/1"), &connector).err().unwrap();
        assert!(err.is_connect());
    }

    #[test]
    fn transient_read_failure_is_reported_then_recovers() {
        let connector = SimulatedConnector::new();
        let device = connector.insert(SimulatedDevice::new("cam/1", 4, 4, PixelFormat::Y8));
        let mut source = HardwareSource::connect(&camera("cam/1"), &connector).unwrap();

        device.set_corrupt(true);
        assert!(matches!(source.poll_once(), Err(SourceError::Header(_))));

        device.set_corrupt(false);
        assert!(source.poll_once().unwrap().is_some());
    }

    #[test]
    fn payload_not_matching_header_geometry_is_rejected() {
        let connector = SimulatedConnector::new();
        let device = connector.insert(SimulatedDevice::new("cam/1", 4, 4, PixelFormat::Y8));
        let mut source = HardwareSource::connect(&camera("cam/1"), &connector).unwrap();

        device.set_short_payload(true);
        assert!(matches!(
            source.poll_once(),
            Err(SourceError::Header(HeaderError::PayloadSize { len: 15, expected: 16 }))
        ));

        // Same counter, retried once the payload is whole again
        device.set_short_payload(false);
        assert_eq!(source.poll_once().unwrap().unwrap().data.len(), 16);
    }

    #[test]
    fn uri_selects_variant() {
        let connector = SimulatedConnector::new();
        let test = open_single(&camera("test"), &connector).unwrap();
        assert_eq!(test.native_size(), (640, 480));

        let sim = open_single(&camera("sim://32x16/Y8"), &connector).unwrap();
        assert_eq!(sim.native_format(), PixelFormat::Y8);

        let net = open_single(&camera("http://127.0.0.1:9/stream"), &connector).unwrap();
        assert_eq!(net.native_format(), PixelFormat::Jpeg);
    }
}
