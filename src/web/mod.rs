//! HTTP and WebSocket surface.
//!
//! - `GET /video/{hash}`: MJPEG multipart stream, one session per client
//! - `GET /ws/{hash}`: MPEG1 relay (MPEG1 mode)
//! - `POST /video_input/`: encoder output sink (MPEG1 mode)
//! - `GET /last_image`: latest frame of the newest session that has one, as JPEG
//! - `GET /shutdown`: stop everything and exit
//! - `GET /status`, `PUT /sources/{which}/live`, `GET /ui`

pub mod control;
pub mod multipart;
pub mod ws;

use std::convert::Infallible;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::capture::device::SharedConnector;
use crate::capture::source::open_source;
use crate::error::TranscodeError;
use crate::pipeline::TranscodeBridge;
use crate::session::{SessionManager, SessionOptions, SourceFactory};
use crate::web::control::CameraControls;
use crate::{Config, OutputFormat};

/// Delay between answering `/shutdown` and stopping the server.
const SHUTDOWN_NOTIFY_DELAY: Duration = Duration::from_millis(100);

pub type SharedState = Arc<AppState>;

/// Shared state for the web server
pub struct AppState {
    config: Arc<Config>,
    factory: SourceFactory,
    sessions: SessionManager,
    bridge: Option<TranscodeBridge>,
    controls: CameraControls,
    shutdown: watch::Sender<bool>,
    started: Instant,
}

impl AppState {
    pub fn new(config: Config, connector: SharedConnector) -> SharedState {
        let config = Arc::new(config);

        let factory: SourceFactory = {
            let config = Arc::clone(&config);
            let connector = Arc::clone(&connector);
            Arc::new(move || open_source(&config, connector.as_ref()))
        };

        let sessions = SessionManager::new(
            config.server.max_concurrent_streams,
            Arc::clone(&factory),
            SessionOptions {
                quality: config.stream.quality,
                idle_timeout: config.stream.idle_timeout(),
            },
        );
        let bridge = (config.stream.format == OutputFormat::Mpeg1).then(TranscodeBridge::new);
        let controls = CameraControls::new(&config, connector);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            factory,
            sessions,
            bridge,
            controls,
            shutdown,
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn bridge(&self) -> Option<&TranscodeBridge> {
        self.bridge.as_ref()
    }

    pub fn controls(&self) -> &CameraControls {
        &self.controls
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Open the configured source once, to fail fast on a dead primary.
    pub async fn probe_source(&self) -> Result<(), crate::error::SourceError> {
        let factory = Arc::clone(&self.factory);
        tokio::task::spawn_blocking(move || factory().map(drop))
            .await
            .unwrap_or_else(|e| Err(crate::error::SourceError::Unsupported(e.to_string())))
    }

    /// Start the MPEG1 encoder, posting back to `port`. No-op in MJPEG modes.
    pub async fn start_transcoder(&self, port: u16) -> Result<(), TranscodeError> {
        let Some(bridge) = &self.bridge else {
            return Ok(());
        };
        let factory = Arc::clone(&self.factory);
        let source = tokio::task::spawn_blocking(move || factory())
            .await
            .map_err(|e| TranscodeError::Producer(std::io::Error::other(e.to_string())))??;
        bridge.start(&self.config.encoder, source, port)
    }

    /// Stop every session and the encoder, then let the server drain.
    pub fn request_shutdown(&self) {
        info!("Shutting down: stopping {} session(s)", self.sessions.len());
        self.sessions.stop_all();
        if let Some(bridge) = &self.bridge {
            bridge.stop();
        }
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Build the router for the configured output format.
pub fn router(state: SharedState) -> Router {
    let hash = &state.config.server.hash;
    let mut app = Router::new()
        .route("/last_image", get(last_image))
        .route("/shutdown", get(shutdown))
        .route("/status", get(control::status))
        .route("/sources/{which}/live", put(control::put_live))
        .route("/ui", get(control::ui));

    app = match state.config.stream.format {
        OutputFormat::Mjpeg | OutputFormat::MjpegDuo => {
            app.route(&format!("/video/{}", hash), get(video_feed))
        }
        OutputFormat::Mpeg1 => app
            .route(&format!("/ws/{}", hash), get(ws_upgrade))
            .route("/video_input/", post(video_input)),
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve until a shutdown is requested, then drain for at most
/// `server.shutdown_grace_ms`.
pub async fn serve(listener: TcpListener, state: SharedState) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    let grace = Duration::from_millis(state.config.server.shutdown_grace_ms);
    let app = router(Arc::clone(&state));

    info!("Serving {} on http://{}", state.config.stream_path(), addr);

    let graceful = wait_for_shutdown(state.shutdown_requested());
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful)
    .into_future();

    let deadline = async {
        wait_for_shutdown(state.shutdown_requested()).await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result,
        _ = deadline => {
            warn!("Open connections did not drain within {:?}, exiting anyway", grace);
            Ok(())
        }
    }
}

async fn wait_for_shutdown(mut requested: watch::Receiver<bool>) {
    let _ = requested.wait_for(|stop| *stop).await;
}

/// GET /video/{hash}
async fn video_feed(
    State(state): State<SharedState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
) -> Response {
    let session = state.sessions.acquire(client);
    let boundary = state.config.server.boundary.clone();
    let parts = session
        .start()
        .map(move |jpeg| Ok::<_, Infallible>(multipart::part(&boundary, &jpeg)));

    (
        [(
            header::CONTENT_TYPE,
            multipart::content_type(&state.config.server.boundary),
        )],
        Body::from_stream(parts),
    )
        .into_response()
}

/// GET /last_image
async fn last_image(State(state): State<SharedState>) -> Response {
    let Some(session) = state.sessions.latest_with_frame() else {
        error!("No session has produced a frame yet");
        return (StatusCode::NOT_FOUND, "Last image not found").into_response();
    };
    let jpeg = tokio::task::spawn_blocking(move || session.last_frame_jpeg())
        .await
        .ok()
        .flatten();
    match jpeg {
        Some(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        None => (StatusCode::NOT_FOUND, "Last image not found").into_response(),
    }
}

/// GET /shutdown
async fn shutdown(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let sessions = state.sessions.len();
    tokio::spawn(async move {
        // Let the response reach the caller first
        tokio::time::sleep(SHUTDOWN_NOTIFY_DELAY).await;
        state.request_shutdown();
    });
    Json(serde_json::json!({ "shutting_down": true, "sessions": sessions }))
}

/// WebSocket upgrade handler
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    let Some(bridge) = state.bridge() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let output = bridge.subscribe();
    let bridge_state = bridge.state();
    ws.on_upgrade(move |socket| ws::handle_ws(socket, output, bridge_state))
}

/// POST /video_input/
async fn video_input(State(state): State<SharedState>, body: Body) -> StatusCode {
    let Some(bridge) = state.bridge() else {
        return StatusCode::NOT_FOUND;
    };
    info!("Encoder output connected");

    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => {
                bridge.publish(chunk);
            }
            Err(e) => {
                warn!("Encoder output stream broke: {}", e);
                break;
            }
        }
    }
    StatusCode::OK
}
