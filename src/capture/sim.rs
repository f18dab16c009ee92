//! In-memory camera device for development without hardware.
//!
//! `sim://WxH/FORMAT` URIs resolve to a [`SimulatedDevice`] that renders a
//! moving gradient behind the same attribute interface a real camera
//! exposes, header prefix included.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::capture::device::{
    AttrValue, DeviceClient, DeviceConnector, ATTR_HEIGHT, ATTR_LAST_IMAGE,
    ATTR_LAST_IMAGE_COUNTER, ATTR_LIVE, ATTR_VIDEO_MODE, ATTR_WIDTH,
};
use crate::capture::frame::PixelFormat;
use crate::capture::header::FrameHeader;
use crate::error::DeviceError;

const DEFAULT_FRAME_PERIOD: Duration = Duration::from_millis(40);

struct SimState {
    live: bool,
    reachable: bool,
    corrupt: bool,
    short_payload: bool,
    counter: i64,
}

pub struct SimulatedDevice {
    uri: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    /// When set, the frame counter advances on its own at this period.
    frame_period: Option<Duration>,
    started: Instant,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    /// Device whose counter only moves through [`SimulatedDevice::advance`].
    pub fn new(uri: &str, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            uri: uri.to_string(),
            width,
            height,
            format,
            frame_period: None,
            started: Instant::now(),
            state: Mutex::new(SimState {
                live: true,
                reachable: true,
                corrupt: false,
                short_payload: false,
                counter: 0,
            }),
        }
    }

    pub fn free_running(mut self, period: Duration) -> Self {
        self.frame_period = Some(period);
        self
    }

    /// Parse `sim://WxH/FORMAT`.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("sim://")?;
        let (size, format) = rest.split_once('/').unwrap_or((rest, "RGB24"));
        let (w, h) = size.split_once('x')?;
        let width: u32 = w.parse().ok().filter(|w| *w > 0)?;
        let height: u32 = h.parse().ok().filter(|h| *h > 0)?;
        let format = PixelFormat::from_video_mode(format)?;
        Some(Self::new(uri, width, height, format).free_running(DEFAULT_FRAME_PERIOD))
    }

    pub fn advance(&self) {
        self.lock().counter += 1;
    }

    pub fn set_live(&self, live: bool) {
        self.lock().live = live;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Serve truncated image buffers until cleared.
    pub fn set_corrupt(&self, corrupt: bool) {
        self.lock().corrupt = corrupt;
    }

    /// Serve payloads one byte shorter than the header geometry until cleared.
    pub fn set_short_payload(&self, short: bool) {
        self.lock().short_payload = short;
    }

    pub fn counter(&self) -> i64 {
        let state = self.lock();
        self.counter_of(&state)
    }

    fn counter_of(&self, state: &SimState) -> i64 {
        match self.frame_period {
            Some(period) => {
                state.counter + (self.started.elapsed().as_nanos() / period.as_nanos().max(1)) as i64
            }
            _ => state.counter,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn image(&self, counter: i64) -> Result<Bytes, DeviceError> {
        let bpp = self.format.bytes_per_pixel().unwrap_or(3);
        let mut buf = Vec::with_capacity(
            crate::capture::header::HEADER_SIZE + (self.width * self.height) as usize * bpp,
        );
        FrameHeader::new(counter.max(0) as u64, self.width, self.height, bpp as u16)
            .encode(&mut buf)
            .map_err(|e| DeviceError::Unreachable {
                uri: self.uri.clone(),
                reason: e.to_string(),
            })?;

        let shift = counter as usize;
        for y in 0..self.height as usize {
            for x in 0..self.width as usize {
                let v = ((x + y + shift) % 256) as u8;
                match bpp {
                    1 => buf.push(v),
                    _ => buf.extend_from_slice(&[v, (y % 256) as u8, 255 - v]),
                }
            }
        }
        Ok(Bytes::from(buf))
    }
}

impl DeviceClient for SimulatedDevice {
    fn ping(&self) -> Result<Duration, DeviceError> {
        if !self.lock().reachable {
            return Err(DeviceError::Unreachable {
                uri: self.uri.clone(),
                reason: "simulated outage".into(),
            });
        }
        Ok(Duration::from_micros(50))
    }

    fn read_attribute(&self, name: &str) -> Result<AttrValue, DeviceError> {
        let state = self.lock();
        if !state.reachable {
            return Err(DeviceError::Unreachable {
                uri: self.uri.clone(),
                reason: "simulated outage".into(),
            });
        }
        let value = match name {
            ATTR_LIVE => AttrValue::Bool(state.live),
            ATTR_LAST_IMAGE_COUNTER => AttrValue::Int(self.counter_of(&state)),
            ATTR_VIDEO_MODE => AttrValue::Str(self.format.to_string()),
            ATTR_WIDTH => AttrValue::Int(self.width as i64),
            ATTR_HEIGHT => AttrValue::Int(self.height as i64),
            ATTR_LAST_IMAGE => {
                let image = self.image(self.counter_of(&state))?;
                if state.corrupt {
                    AttrValue::Bytes(image.slice(..8))
                } else if state.short_payload {
                    AttrValue::Bytes(image.slice(..image.len() - 1))
                } else {
                    AttrValue::Bytes(image)
                }
            }
            other => {
                return Err(DeviceError::MissingAttribute {
                    name: other.to_string(),
                })
            }
        };
        Ok(value)
    }

    fn write_attribute(&self, name: &str, value: AttrValue) -> Result<(), DeviceError> {
        match (name, value) {
            (ATTR_LIVE, AttrValue::Bool(live)) => {
                self.set_live(live);
                Ok(())
            }
            (ATTR_LIVE, _) => Err(DeviceError::AttributeType {
                name: name.to_string(),
                expected: "bool",
            }),
            (other, _) => Err(DeviceError::ReadOnly {
                name: other.to_string(),
            }),
        }
    }
}

/// Client handle sharing one simulated device.
struct SharedSim(Arc<SimulatedDevice>);

impl DeviceClient for SharedSim {
    fn ping(&self) -> Result<Duration, DeviceError> {
        self.0.ping()
    }

    fn read_attribute(&self, name: &str) -> Result<AttrValue, DeviceError> {
        self.0.read_attribute(name)
    }

    fn write_attribute(&self, name: &str, value: AttrValue) -> Result<(), DeviceError> {
        self.0.write_attribute(name, value)
    }
}

/// Connector resolving `sim://` URIs; every connect to the same URI shares
/// one device so live flags written through one client are seen by all.
#[derive(Default)]
pub struct SimulatedConnector {
    devices: Mutex<HashMap<String, Arc<SimulatedDevice>>>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its URI and return the shared handle.
    pub fn insert(&self, device: SimulatedDevice) -> Arc<SimulatedDevice> {
        let device = Arc::new(device);
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.uri.clone(), Arc::clone(&device));
        device
    }

    pub fn device(&self, uri: &str) -> Option<Arc<SimulatedDevice>> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(uri)
            .cloned()
    }
}

impl DeviceConnector for SimulatedConnector {
    fn connect(&self, uri: &str) -> Result<Box<dyn DeviceClient>, DeviceError> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let device = match devices.get(uri) {
            Some(device) => Arc::clone(device),
            None => {
                if !uri.starts_with("sim://") {
                    return Err(DeviceError::NoBackend(uri.to_string()));
                }
                let device = SimulatedDevice::from_uri(uri).ok_or_else(|| DeviceError::Unreachable {
                    uri: uri.to_string(),
                    reason: "expected sim://WxH/FORMAT".into(),
                })?;
                let device = Arc::new(device);
                devices.insert(uri.to_string(), Arc::clone(&device));
                device
            }
        };
        Ok(Box::new(SharedSim(device)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sim_uri() {
        let dev = SimulatedDevice::from_uri("sim://320x240/Y8").unwrap();
        assert_eq!((dev.width, dev.height, dev.format), (320, 240, PixelFormat::Y8));
        assert!(SimulatedDevice::from_uri("sim://0x240/Y8").is_none());
        assert!(SimulatedDevice::from_uri("tango://cam/1").is_none());
    }

    #[test]
    fn image_carries_header_and_payload() {
        let dev = SimulatedDevice::new("sim://a", 4, 2, PixelFormat::Rgb24);
        dev.advance();
        let AttrValue::Bytes(buf) = dev.read_attribute(ATTR_LAST_IMAGE).unwrap() else {
            panic!("expected bytes");
        };
        let (header, payload) = FrameHeader::split(&buf).unwrap();
        assert_eq!((header.sequence, header.width, header.height), (1, 4, 2));
        assert_eq!(payload.len(), 4 * 2 * 3);
    }

    #[test]
    fn connector_shares_devices_per_uri() {
        let connector = SimulatedConnector::new();
        let a = connector.connect("sim://8x8/Y8").unwrap();
        let b = connector.connect("sim://8x8/Y8").unwrap();
        a.write_attribute(ATTR_LIVE, AttrValue::Bool(false)).unwrap();
        assert_eq!(b.read_attribute(ATTR_LIVE).unwrap(), AttrValue::Bool(false));
    }

    #[test]
    fn unreachable_device_fails_ping() {
        let dev = SimulatedDevice::new("sim://a", 4, 2, PixelFormat::Y8);
        dev.set_reachable(false);
        assert!(dev.ping().is_err());
    }
}
