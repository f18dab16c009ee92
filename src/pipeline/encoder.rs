//! MPEG1 transcode bridge.
//!
//! Raw frames are piped into an external encoder process. The encoder posts
//! its MPEG-TS output back to this server's `/video_input/` endpoint, and
//! every posted chunk is fanned out to WebSocket subscribers.

use std::io::{ErrorKind, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{FrameSource, PixelFormat, RawFrame, SourceDescriptor};
use crate::error::{SinkError, SourceError, TranscodeError};
use crate::pipeline::channel::FrameSink;
use crate::pipeline::producer::{spawn_producer, ProducerHandle};
use crate::EncoderConfig;

const BROADCAST_CAPACITY: usize = 64;
const WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// Lifecycle of the encoder process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Running,
    Stopped,
    /// Encoder exited without being asked to
    Failed(String),
}

/// Frame sink writing raw pixels to the encoder's stdin.
pub struct EncoderSink {
    stdin: ChildStdin,
}

impl FrameSink for EncoderSink {
    fn accept(&mut self, frame: RawFrame) -> Result<(), SinkError> {
        let written = self
            .stdin
            .write_all(&frame.data)
            .and_then(|_| self.stdin.flush());
        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(SinkError::Closed),
            Err(e) => Err(SinkError::Io(e)),
        }
    }
}

/// Encoder command line for a source of the given geometry.
pub fn encoder_args(
    encoder: &EncoderConfig,
    source: &SourceDescriptor,
    port: u16,
) -> Result<Vec<String>, TranscodeError> {
    let pixel_format = source
        .format
        .encoder_name()
        .ok_or_else(|| TranscodeError::Format(source.format.to_string()))?;

    let (out_w, out_h) = match encoder.size {
        [0, _] | [_, 0] => source.size(),
        [w, h] => (w, h),
    };

    Ok(vec![
        "-f".into(),
        "rawvideo".into(),
        "-pixel_format".into(),
        pixel_format.into(),
        "-s".into(),
        format!("{}x{}", source.width, source.height),
        "-i".into(),
        "-".into(),
        "-f".into(),
        "mpegts".into(),
        "-q:v".into(),
        encoder.quality.to_string(),
        "-vf".into(),
        format!("scale={}:{}", out_w, out_h),
        "-vcodec".into(),
        "mpeg1video".into(),
        format!("http://127.0.0.1:{}/video_input/", port),
    ])
}

/// Owns the encoder process, its feeding producer, and the subscriber fan-out.
pub struct TranscodeBridge {
    output: broadcast::Sender<Bytes>,
    state: Arc<watch::Sender<BridgeState>>,
    child: Arc<Mutex<Option<Child>>>,
    producer: Mutex<Option<ProducerHandle>>,
    stopping: Arc<AtomicBool>,
}

impl TranscodeBridge {
    pub fn new() -> Self {
        let (output, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state, _) = watch::channel(BridgeState::Idle);
        Self {
            output,
            state: Arc::new(state),
            child: Arc::new(Mutex::new(None)),
            producer: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.output.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.output.receiver_count()
    }

    /// Fan one chunk of encoder output out to every subscriber.
    pub fn publish(&self, chunk: Bytes) -> usize {
        self.output.send(chunk).unwrap_or(0)
    }

    /// Spawn the encoder for `source` and start feeding it.
    #[instrument(skip_all, fields(program = %encoder.program, port = port))]
    pub fn start(
        &self,
        encoder: &EncoderConfig,
        source: Box<dyn FrameSource>,
        port: u16,
    ) -> Result<(), TranscodeError> {
        let descriptor = source.layout().primary().clone();
        if descriptor.format == PixelFormat::Jpeg {
            return Err(TranscodeError::Format(descriptor.format.to_string()));
        }
        let args = encoder_args(encoder, &descriptor, port)?;
        debug!("Encoder command: {} {}", encoder.program, args.join(" "));

        let stderr = if encoder.debug {
            Stdio::inherit()
        } else {
            Stdio::null()
        };
        let mut child = Command::new(&encoder.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                program: encoder.program.clone(),
                source,
            })?;
        let stdin = child.stdin.take().ok_or(TranscodeError::NoStdin)?;

        info!(
            "Encoder {} started for {}x{} {} (pid {})",
            encoder.program,
            descriptor.width,
            descriptor.height,
            descriptor.format,
            child.id()
        );

        self.stopping.store(false, Ordering::Release);
        *lock(&self.child) = Some(child);
        self.state.send_replace(BridgeState::Running);
        self.spawn_watcher();

        // Source is already open; hand it over as-is
        let producer = spawn_producer(
            "encoder",
            move || Ok::<_, SourceError>(source),
            EncoderSink { stdin },
            Duration::MAX,
        )
        .map_err(TranscodeError::Producer)?;
        *lock(&self.producer) = Some(producer);
        Ok(())
    }

    /// Kill the encoder and stop its producer.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        if let Some(producer) = lock(&self.producer).take() {
            producer.stop();
        }
        if let Some(mut child) = lock(&self.child).take() {
            let _ = child.kill();
            let _ = child.wait();
            info!("Encoder stopped");
        }
        self.state.send_if_modified(|state| {
            if *state == BridgeState::Running {
                *state = BridgeState::Stopped;
                true
            } else {
                false
            }
        });
    }

    fn spawn_watcher(&self) {
        let child = Arc::clone(&self.child);
        let state = Arc::clone(&self.state);
        let stopping = Arc::clone(&self.stopping);

        let spawned = thread::Builder::new()
            .name("encoder-watch".into())
            .spawn(move || loop {
                thread::sleep(WATCH_INTERVAL);
                let mut guard = lock(&child);
                let Some(process) = guard.as_mut() else {
                    return;
                };
                match process.try_wait() {
                    Ok(None) => continue,
                    Ok(Some(status)) => {
                        guard.take();
                        if stopping.load(Ordering::Acquire) {
                            state.send_replace(BridgeState::Stopped);
                        } else {
                            let failure = TranscodeError::ProcessFailure {
                                status: status.to_string(),
                            };
                            error!("{}", failure);
                            state.send_replace(BridgeState::Failed(status.to_string()));
                        }
                        return;
                    }
                    Err(e) => {
                        warn!("Cannot poll encoder process: {}", e);
                        return;
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("Encoder watcher not started: {}", e);
        }
    }
}

impl Default for TranscodeBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TranscodeBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Transform;
    use crate::capture::source::TestSource;
    use crate::CameraConfig;
    use std::time::Instant;

    fn descriptor(format: PixelFormat) -> SourceDescriptor {
        SourceDescriptor {
            uri: "sim://enc".into(),
            width: 320,
            height: 240,
            format,
            transform: Transform::default(),
            exposure: Duration::from_millis(50),
        }
    }

    #[test]
    fn args_follow_source_geometry() {
        let encoder = EncoderConfig::default();
        let args = encoder_args(&encoder, &descriptor(PixelFormat::Y8), 8000).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-pixel_format gray"));
        assert!(joined.contains("-s 320x240"));
        assert!(joined.contains("scale=320:240"));
        assert!(joined.contains("-q:v 4"));
        assert_eq!(args.last().unwrap(), "http://127.0.0.1:8000/video_input/");
    }

    #[test]
    fn args_use_configured_output_size() {
        let encoder = EncoderConfig {
            size: [640, 360],
            ..EncoderConfig::default()
        };
        let args = encoder_args(&encoder, &descriptor(PixelFormat::Rgb24), 9000).unwrap();
        assert!(args.contains(&"rgb24".to_string()));
        assert!(args.contains(&"scale=640:360".to_string()));
    }

    #[test]
    fn jpeg_input_is_rejected() {
        let err = encoder_args(&EncoderConfig::default(), &descriptor(PixelFormat::Jpeg), 1);
        assert!(matches!(err, Err(TranscodeError::Format(_))));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let bridge = TranscodeBridge::new();
        let encoder = EncoderConfig {
            program: "/nonexistent/encoder".into(),
            ..EncoderConfig::default()
        };
        let source = Box::new(TestSource::new(&CameraConfig::default()));
        let err = bridge.start(&encoder, source, 1).unwrap_err();
        assert!(matches!(err, TranscodeError::Spawn { .. }));
        assert_eq!(*bridge.state().borrow(), BridgeState::Idle);
    }

    #[cfg(unix)]
    #[test]
    fn unexpected_exit_is_reported() {
        let bridge = TranscodeBridge::new();
        let encoder = EncoderConfig {
            program: "true".into(),
            ..EncoderConfig::default()
        };
        let source = Box::new(TestSource::new(&CameraConfig::default()));
        bridge.start(&encoder, source, 1).unwrap();

        let state = bridge.state();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !matches!(*state.borrow(), BridgeState::Failed(_)) {
            assert!(Instant::now() < deadline, "failure not reported");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let bridge = TranscodeBridge::new();
        let mut a = bridge.subscribe();
        let mut b = bridge.subscribe();
        assert_eq!(bridge.publish(Bytes::from_static(b"ts")), 2);
        assert_eq!(a.try_recv().unwrap(), Bytes::from_static(b"ts"));
        assert_eq!(b.try_recv().unwrap(), Bytes::from_static(b"ts"));
    }
}
