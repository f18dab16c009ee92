//! End-to-end tests against a real listener.
//!
//! Cameras are simulated devices; no hardware or encoder binary is needed.
//!
//! Run: `cargo test --test relay`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use image::{ColorType, GenericImageView};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;

use camrelay::capture::sim::{SimulatedConnector, SimulatedDevice};
use camrelay::web::{self, AppState, SharedState};
use camrelay::{CameraConfig, Config, OutputFormat, PixelFormat};

const HASH: &str = "abc";
const FRAME_PERIOD: Duration = Duration::from_millis(20);

// ── Helpers ──────────────────────────────────────────────────────────

fn camera(uri: &str) -> CameraConfig {
    CameraConfig {
        uri: uri.into(),
        exposure_time: 0.02,
        ..CameraConfig::default()
    }
}

fn config(format: OutputFormat, primary: &str) -> Config {
    let mut config = Config::default();
    config.server.hash = HASH.into();
    config.server.shutdown_grace_ms = 500;
    config.stream.format = format;
    config.primary = camera(primary);
    config
}

/// Start a server on an ephemeral port.
async fn start_server(
    config: Config,
    connector: Arc<SimulatedConnector>,
) -> (SocketAddr, SharedState, JoinHandle<std::io::Result<()>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(config, connector);
    let server = tokio::spawn(web::serve(listener, Arc::clone(&state)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, state, server)
}

/// Read the next multipart part body from a streaming response.
async fn next_part(response: &mut reqwest::Response, buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        if let Some(part) = take_part(buffer) {
            return Some(part);
        }
        let chunk = tokio::time::timeout(Duration::from_secs(10), response.chunk())
            .await
            .ok()?
            .ok()??;
        buffer.extend_from_slice(&chunk);
    }
}

fn take_part(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let head_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&buffer[..head_end]).ok()?;
    assert!(head.starts_with("--frame\r\n"), "unexpected part head {:?}", head);
    assert!(head.contains("Content-Type: image/jpeg"));
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))?
        .trim()
        .parse()
        .ok()?;

    let body_start = head_end + 4;
    if buffer.len() < body_start + len + 2 {
        return None;
    }
    let body = buffer[body_start..body_start + len].to_vec();
    buffer.drain(..body_start + len + 2);
    Some(body)
}

// ── MJPEG ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn mjpeg_stream_delivers_jpeg_parts() {
    let (addr, _state, _server) =
        start_server(config(OutputFormat::Mjpeg, "test"), Arc::new(SimulatedConnector::new())).await;

    let mut response = reqwest::get(format!("http://{}/video/{}", addr, HASH))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "multipart/x-mixed-replace;boundary=\"frame\""
    );

    let mut buffer = Vec::new();
    let first = next_part(&mut response, &mut buffer).await.expect("first part");
    let second = next_part(&mut response, &mut buffer).await.expect("second part");

    let image = image::load_from_memory(&first).unwrap();
    assert_eq!(image.dimensions(), (640, 480));
    assert_eq!(&second[..2], &[0xFF, 0xD8]);
}

#[tokio::test(flavor = "multi_thread")]
async fn last_image_is_404_without_sessions() {
    let (addr, _state, _server) =
        start_server(config(OutputFormat::Mjpeg, "test"), Arc::new(SimulatedConnector::new())).await;

    let response = reqwest::get(format!("http://{}/last_image", addr)).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn duo_falls_back_to_secondary_and_renders_its_geometry() {
    let connector = Arc::new(SimulatedConnector::new());
    let primary = connector.insert(
        SimulatedDevice::new("sim://primary", 640, 480, PixelFormat::Rgb24).free_running(FRAME_PERIOD),
    );
    connector.insert(
        SimulatedDevice::new("sim://secondary", 320, 240, PixelFormat::Y8).free_running(FRAME_PERIOD),
    );
    primary.set_live(false);

    let mut config = config(OutputFormat::MjpegDuo, "sim://primary");
    config.secondary = Some(camera("sim://secondary"));
    let (addr, _state, _server) = start_server(config, connector).await;

    let mut response = reqwest::get(format!("http://{}/video/{}", addr, HASH))
        .await
        .unwrap();
    let mut buffer = Vec::new();
    let jpeg = next_part(&mut response, &mut buffer).await.expect("secondary frame");

    // 320 * 240 bytes can only be the Y8 camera
    let image = image::load_from_memory(&jpeg).unwrap();
    assert_eq!(image.dimensions(), (320, 240));
    assert_eq!(image.color(), ColorType::L8);

    let still = reqwest::get(format!("http://{}/last_image", addr)).await.unwrap();
    assert_eq!(still.status(), 200);
    assert_eq!(still.headers()["content-type"], "image/jpeg");
    let still = image::load_from_memory(&still.bytes().await.unwrap()).unwrap();
    assert_eq!(still.dimensions(), (320, 240));
}

#[tokio::test(flavor = "multi_thread")]
async fn oldest_stream_is_closed_when_over_capacity() {
    let mut config = config(OutputFormat::Mjpeg, "test");
    config.server.max_concurrent_streams = 1;
    let (addr, state, _server) = start_server(config, Arc::new(SimulatedConnector::new())).await;
    let url = format!("http://{}/video/{}", addr, HASH);

    let mut first = reqwest::get(&url).await.unwrap();
    let mut first_buffer = Vec::new();
    next_part(&mut first, &mut first_buffer).await.expect("first client streams");

    // A separate client opens a separate connection
    let mut second = reqwest::Client::new().get(&url).send().await.unwrap();
    let mut second_buffer = Vec::new();
    next_part(&mut second, &mut second_buffer).await.expect("second client streams");

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while first.chunk().await.ok().flatten().is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "evicted stream should end");
    assert_eq!(state.sessions().len(), 1);
}

// ── Control plane ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn live_flag_can_be_toggled_and_read_back() {
    let connector = Arc::new(SimulatedConnector::new());
    connector.insert(SimulatedDevice::new("sim://cam", 32, 24, PixelFormat::Y8));
    let (addr, _state, _server) =
        start_server(config(OutputFormat::Mjpeg, "sim://cam"), connector).await;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("http://{}/sources/primary/live", addr))
        .json(&serde_json::json!({ "live": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let status: serde_json::Value = client
        .get(format!("http://{}/status", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["format"], "MJPEG");
    assert_eq!(status["stream"], "/video/abc");
    assert_eq!(status["cameras"]["primary"]["live"], false);

    let response = client
        .put(format!("http://{}/sources/secondary/live", addr))
        .json(&serde_json::json!({ "live": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn synthetic_source_has_no_live_flag() {
    let (addr, _state, _server) =
        start_server(config(OutputFormat::Mjpeg, "test"), Arc::new(SimulatedConnector::new())).await;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("http://{}/sources/primary/live", addr))
        .json(&serde_json::json!({ "live": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    let status: serde_json::Value = client
        .get(format!("http://{}/status", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(status["cameras"]["primary"]["live"].is_null());

    let ui = client.get(format!("http://{}/ui", addr)).send().await.unwrap();
    assert!(ui.text().await.unwrap().contains("/video/abc"));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_the_server() {
    let (addr, state, server) =
        start_server(config(OutputFormat::Mjpeg, "test"), Arc::new(SimulatedConnector::new())).await;

    let mut stream = reqwest::get(format!("http://{}/video/{}", addr, HASH)).await.unwrap();
    let mut buffer = Vec::new();
    next_part(&mut stream, &mut buffer).await.expect("streaming before shutdown");

    let response = reqwest::get(format!("http://{}/shutdown", addr)).await.unwrap();
    assert_eq!(response.status(), 200);

    let finished = tokio::time::timeout(Duration::from_secs(5), server).await;
    assert!(finished.is_ok(), "server should exit after shutdown");
    assert!(state.sessions().is_empty());
}

// ── MPEG1 relay ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn encoder_output_is_broadcast_to_websockets() {
    let (addr, state, _server) =
        start_server(config(OutputFormat::Mpeg1, "test"), Arc::new(SimulatedConnector::new())).await;

    let url = format!("ws://{}/ws/{}", addr, HASH);
    let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while state.bridge().unwrap().subscribers() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "subscribers never attached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = reqwest::Client::new()
        .post(format!("http://{}/video_input/", addr))
        .body(b"\x47mpegts-chunk".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    for ws in [&mut a, &mut b] {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            tungstenite::Message::Binary(data) => assert_eq!(&data[..], b"\x47mpegts-chunk"),
            other => panic!("unexpected message {:?}", other),
        }
    }

    a.send(tungstenite::Message::Close(None)).await.unwrap();
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn late_subscriber_is_closed_when_encoder_already_failed() {
    let mut config = config(OutputFormat::Mpeg1, "test");
    // Exits at once without reading its input
    config.encoder.program = "true".into();
    let (addr, state, _server) = start_server(config, Arc::new(SimulatedConnector::new())).await;
    state.start_transcoder(addr.port()).await.unwrap();

    let bridge = state.bridge().unwrap().state();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !matches!(*bridge.borrow(), camrelay::pipeline::BridgeState::Failed(_)) {
        assert!(tokio::time::Instant::now() < deadline, "encoder failure never reported");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/{}", addr, HASH))
        .await
        .unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("subscriber must not hang")
        .unwrap()
        .unwrap();
    match msg {
        tungstenite::Message::Close(Some(frame)) => {
            assert_eq!(frame.code, tungstenite::protocol::frame::coding::CloseCode::Error);
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn mjpeg_routes_are_absent_in_mpeg1_mode() {
    let (addr, _state, _server) =
        start_server(config(OutputFormat::Mpeg1, "test"), Arc::new(SimulatedConnector::new())).await;

    let response = reqwest::get(format!("http://{}/video/{}", addr, HASH)).await.unwrap();
    assert_eq!(response.status(), 404);
}
