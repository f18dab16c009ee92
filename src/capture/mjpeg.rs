//! Passive network source for cameras that already speak MJPEG over HTTP.
//!
//! Parts of the camera's multipart stream are relayed verbatim; nothing is
//! decoded or re-encoded. A camera answering with a plain body instead of a
//! multipart stream is treated as a snapshot endpoint: the whole body is one
//! frame and the next poll reconnects.

use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use image::GenericImageView;
use tracing::{debug, info, warn};

use crate::capture::dual::FrameLayout;
use crate::capture::frame::{PixelFormat, RawFrame, SourceDescriptor, Transform};
use crate::capture::source::FrameSource;
use crate::error::SourceError;
use crate::CameraConfig;

const MAX_PART_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

enum Stream {
    Multipart {
        reader: Box<dyn Read + Send + Sync>,
        splitter: PartSplitter,
    },
    Whole(Box<dyn Read + Send + Sync>),
}

pub struct MjpegSource {
    descriptor: SourceDescriptor,
    stream: Option<Stream>,
    sequence: u64,
    failed: bool,
}

impl MjpegSource {
    /// Does not connect; the first poll does.
    pub fn new(camera: &CameraConfig) -> Self {
        Self {
            descriptor: SourceDescriptor {
                uri: camera.uri.clone(),
                width: 0,
                height: 0,
                format: PixelFormat::Jpeg,
                transform: Transform::from_config(camera),
                exposure: camera.exposure(),
            },
            stream: None,
            sequence: 0,
            failed: false,
        }
    }

    fn network_error(&self, reason: impl std::fmt::Display) -> SourceError {
        SourceError::Network {
            url: self.descriptor.uri.clone(),
            reason: reason.to_string(),
        }
    }

    fn connect(&mut self) -> Result<Stream, SourceError> {
        let response = match ureq::get(&self.descriptor.uri).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(self.network_error(format!("unexpected status code {}", code)))
            }
            Err(e) => return Err(self.network_error(e)),
        };

        let content_type = response.header("Content-Type").unwrap_or("").to_string();
        let reader = response.into_reader();
        match boundary_from_content_type(&content_type) {
            Some(boundary) => {
                info!(
                    "Receiving multipart stream from {} (boundary {:?})",
                    self.descriptor.uri, boundary
                );
                Ok(Stream::Multipart {
                    reader,
                    splitter: PartSplitter::new(&boundary),
                })
            }
            None => {
                debug!("{} is not multipart ({}), reading whole body", self.descriptor.uri, content_type);
                Ok(Stream::Whole(reader))
            }
        }
    }

    fn read_frame(&self, stream: &mut Stream) -> Result<Option<Bytes>, SourceError> {
        match stream {
            Stream::Multipart { reader, splitter } => {
                let mut chunk = vec![0u8; READ_CHUNK];
                loop {
                    if let Some(part) = splitter.next_part() {
                        return Ok(Some(part));
                    }
                    let read = reader
                        .read(&mut chunk)
                        .map_err(|e| self.network_error(e))?;
                    if read == 0 {
                        return Err(self.network_error("stream ended"));
                    }
                    splitter.push(&chunk[..read]);
                }
            }
            Stream::Whole(reader) => {
                let body = read_capped(reader, MAX_PART_BYTES)
                    .map_err(|e| self.network_error(e))?
                    .ok_or_else(|| {
                        self.network_error(format!("snapshot exceeds {} bytes", MAX_PART_BYTES))
                    })?;
                Ok((!body.is_empty()).then(|| Bytes::from(body)))
            }
        }
    }

    fn learn_size(&mut self, jpeg: &[u8]) {
        if self.descriptor.width != 0 {
            return;
        }
        match image::load_from_memory(jpeg) {
            Ok(image) => {
                let (width, height) = image.dimensions();
                info!("{} delivers {}x{} JPEG", self.descriptor.uri, width, height);
                self.descriptor.width = width;
                self.descriptor.height = height;
            }
            Err(e) => warn!("{} sent an undecodable frame: {}", self.descriptor.uri, e),
        }
    }
}

impl FrameSource for MjpegSource {
    fn poll_once(&mut self) -> Result<Option<RawFrame>, SourceError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => match self.connect() {
                Ok(stream) => stream,
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            },
        };

        let result = self.read_frame(&mut stream);
        self.failed = result.is_err();

        // Snapshot endpoints reconnect on every poll
        if matches!(stream, Stream::Multipart { .. }) && result.is_ok() {
            self.stream = Some(stream);
        }

        let Some(jpeg) = result? else {
            return Ok(None);
        };
        self.learn_size(&jpeg);
        self.sequence += 1;
        metrics::counter!("frames_polled").increment(1);
        Ok(Some(RawFrame::new(jpeg, self.sequence)))
    }

    fn native_size(&self) -> (u32, u32) {
        self.descriptor.size()
    }

    fn native_format(&self) -> PixelFormat {
        PixelFormat::Jpeg
    }

    fn layout(&self) -> FrameLayout {
        FrameLayout::single(self.descriptor.clone())
    }

    /// Reads block at the camera's pace; only back off after failures.
    fn next_poll_delay(&self) -> Duration {
        if self.failed {
            self.descriptor.exposure
        } else {
            Duration::ZERO
        }
    }
}

/// Extract the boundary token from a `multipart/*` content type.
/// Whole body of `reader`, or `None` if it is longer than `limit` bytes.
fn read_capped(reader: impl Read, limit: usize) -> std::io::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut body)?;
    Ok((body.len() <= limit).then_some(body))
}

pub(crate) fn boundary_from_content_type(content_type: &str) -> Option<String> {
    if !content_type.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"').to_string())
        })
        .filter(|b| !b.is_empty())
}

/// Incremental splitter for `--boundary` delimited multipart bodies.
pub(crate) struct PartSplitter {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
}

impl PartSplitter {
    pub(crate) fn new(boundary: &str) -> Self {
        let boundary = boundary.strip_prefix("--").unwrap_or(boundary);
        Self {
            delimiter: format!("--{}", boundary).into_bytes(),
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_PART_BYTES * 2 {
            // Runaway part with no delimiter in sight; resynchronise
            let keep = self.delimiter.len().min(self.buffer.len());
            let drain_len = self.buffer.len() - keep;
            self.buffer.drain(..drain_len);
        }
    }

    /// Body of the next complete part, without its headers.
    pub(crate) fn next_part(&mut self) -> Option<Bytes> {
        loop {
            let start = find(&self.buffer, &self.delimiter, 0)?;
            let content = start + self.delimiter.len();
            let end = find(&self.buffer, &self.delimiter, content)?;

            let part = &self.buffer[content..end];
            let body = split_headers(part);
            let body = Bytes::copy_from_slice(body);
            self.buffer.drain(..end);

            if !body.is_empty() {
                return Some(body);
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < needle.len() || from > haystack.len() - needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// Drop the part headers and the CRLF that precedes the next delimiter.
fn split_headers(part: &[u8]) -> &[u8] {
    let body = match find(part, b"\r\n\r\n", 0) {
        Some(pos) => &part[pos + 4..],
        None => match find(part, b"\n\n", 0) {
            Some(pos) => &part[pos + 2..],
            None => part,
        },
    };
    let body = body.strip_suffix(b"\r\n").unwrap_or(body);
    body.strip_suffix(b"\n").unwrap_or(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    const JPEG_A: &[u8] = &[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
    const JPEG_B: &[u8] = &[0xFF, 0xD8, 4, 5, 6, 7, 0xFF, 0xD9];

    fn part(boundary: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            boundary,
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    #[test]
    fn parses_boundary() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=\"frame\"").as_deref(),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=--abc").as_deref(),
            Some("--abc")
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
    }

    #[test]
    fn splits_parts_across_chunk_edges() {
        let mut stream = part("frame", JPEG_A);
        stream.extend(part("frame", JPEG_B));
        stream.extend(b"--frame\r\n");

        let mut splitter = PartSplitter::new("frame");
        let mut parts = Vec::new();
        for chunk in stream.chunks(5) {
            splitter.push(chunk);
            while let Some(p) = splitter.next_part() {
                parts.push(p);
            }
        }
        assert_eq!(parts, vec![Bytes::from_static(JPEG_A), Bytes::from_static(JPEG_B)]);
    }

    #[test]
    fn incomplete_part_waits_for_next_delimiter() {
        let mut splitter = PartSplitter::new("b");
        splitter.push(&part("b", JPEG_A));
        assert!(splitter.next_part().is_none());
        splitter.push(b"--b");
        assert_eq!(splitter.next_part().unwrap(), Bytes::from_static(JPEG_A));
    }

    #[test]
    fn relays_parts_from_live_stream_verbatim() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = conn.read(&mut request);
            let mut body = part("cam", JPEG_A);
            body.extend(part("cam", JPEG_B));
            body.extend(b"--cam--\r\n");
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=cam\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            conn.write_all(head.as_bytes()).unwrap();
            conn.write_all(&body).unwrap();
        });

        let camera = CameraConfig {
            uri: format!("http://{}/stream", addr),
            ..CameraConfig::default()
        };
        let mut source = MjpegSource::new(&camera);
        let a = source.poll_once().unwrap().unwrap();
        let b = source.poll_once().unwrap().unwrap();
        assert_eq!(&a.data[..], JPEG_A);
        assert_eq!(&b.data[..], JPEG_B);
        assert_eq!((a.sequence, b.sequence), (1, 2));
        assert_eq!(source.next_poll_delay(), Duration::ZERO);
    }

    #[test]
    fn oversized_body_is_rejected_not_truncated() {
        assert_eq!(read_capped(&b"12345"[..], 5).unwrap(), Some(b"12345".to_vec()));
        assert_eq!(read_capped(&b"123456"[..], 5).unwrap(), None);
        assert_eq!(read_capped(&b""[..], 5).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn snapshot_endpoint_delivers_whole_body() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = conn.read(&mut request);
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                JPEG_A.len()
            );
            conn.write_all(head.as_bytes()).unwrap();
            conn.write_all(JPEG_A).unwrap();
        });

        let camera = CameraConfig {
            uri: format!("http://{}/snapshot.jpg", addr),
            ..CameraConfig::default()
        };
        let mut source = MjpegSource::new(&camera);
        let frame = source.poll_once().unwrap().unwrap();
        assert_eq!(&frame.data[..], JPEG_A);
    }

    #[test]
    fn unreachable_camera_is_transient() {
        let camera = CameraConfig {
            uri: "http://127.0.0.1:9/stream".into(),
            ..CameraConfig::default()
        };
        let mut source = MjpegSource::new(&camera);
        assert!(matches!(source.poll_once(), Err(SourceError::Network { .. })));
        assert_eq!(source.next_poll_delay(), camera.exposure());
    }
}
