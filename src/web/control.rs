//! Camera control plane: live flags and server status.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::capture::device::{CameraDevice, SharedConnector};
use crate::capture::Camera;
use crate::error::SourceError;
use crate::web::SharedState;
use crate::{CameraConfig, Config, OutputFormat};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no {0} camera configured")]
    NoSuchCamera(String),

    #[error("{0} is not a device camera")]
    NotADevice(String),

    #[error(transparent)]
    Device(#[from] SourceError),

    #[error("control task failed")]
    Task,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match self {
            ControlError::NoSuchCamera(_) => StatusCode::NOT_FOUND,
            ControlError::NotADevice(_) => StatusCode::CONFLICT,
            ControlError::Device(_) => StatusCode::BAD_GATEWAY,
            ControlError::Task => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Direct access to the configured cameras, outside any session.
pub struct CameraControls {
    connector: SharedConnector,
    primary: CameraConfig,
    secondary: Option<CameraConfig>,
}

impl CameraControls {
    pub fn new(config: &Config, connector: SharedConnector) -> Self {
        Self {
            connector,
            primary: config.primary.clone(),
            secondary: config.secondary.clone(),
        }
    }

    pub fn camera(&self, which: Camera) -> Option<&CameraConfig> {
        match which {
            Camera::Primary => Some(&self.primary),
            Camera::Secondary => self.secondary.as_ref(),
        }
    }

    fn device(&self, which: Camera) -> Result<CameraDevice, ControlError> {
        let camera = self
            .camera(which)
            .ok_or_else(|| ControlError::NoSuchCamera(which.to_string()))?;
        if !is_device(camera) {
            return Err(ControlError::NotADevice(camera.uri.clone()));
        }
        Ok(CameraDevice::connect(self.connector.as_ref(), &camera.uri)?)
    }

    /// Live flag of a device camera; `None` for synthetic and network sources.
    pub fn live(&self, which: Camera) -> Result<Option<bool>, ControlError> {
        match self.device(which) {
            Ok(device) => Ok(Some(device.is_live()?)),
            Err(ControlError::NotADevice(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_live(&self, which: Camera, live: bool) -> Result<(), ControlError> {
        let device = self.device(which)?;
        device.set_live(live)?;
        info!("Set {} camera {} live={}", which, device.uri(), live);
        Ok(())
    }
}

fn is_device(camera: &CameraConfig) -> bool {
    camera.uri != "test" && !camera.is_network()
}

fn parse_camera(name: &str) -> Result<Camera, ControlError> {
    match name {
        "primary" => Ok(Camera::Primary),
        "secondary" => Ok(Camera::Secondary),
        other => Err(ControlError::NoSuchCamera(other.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct LiveRequest {
    pub live: bool,
}

/// PUT /sources/{which}/live
pub async fn put_live(
    State(state): State<SharedState>,
    Path(which): Path<String>,
    Json(request): Json<LiveRequest>,
) -> Result<Json<serde_json::Value>, ControlError> {
    let camera = parse_camera(&which)?;
    let task_state = state.clone();
    tokio::task::spawn_blocking(move || task_state.controls().set_live(camera, request.live))
        .await
        .map_err(|_| ControlError::Task)??;
    Ok(Json(json!({ "camera": which, "live": request.live })))
}

/// GET /status
pub async fn status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let task_state = state.clone();
    let cameras = tokio::task::spawn_blocking(move || {
        let controls = task_state.controls();
        let mut cameras = serde_json::Map::new();
        for which in [Camera::Primary, Camera::Secondary] {
            let Some(camera) = controls.camera(which) else {
                continue;
            };
            let live = controls.live(which).unwrap_or_else(|e| {
                warn!("Cannot read live flag of {}: {}", camera.uri, e);
                None
            });
            cameras.insert(
                which.to_string(),
                json!({ "uri": camera.uri, "live": live }),
            );
        }
        cameras
    })
    .await
    .unwrap_or_default();

    let sessions: Vec<serde_json::Value> = state
        .sessions()
        .clients()
        .into_iter()
        .map(|client| json!({ "client": client.to_string() }))
        .collect();

    let encoder = state
        .bridge()
        .map(|bridge| format!("{:?}", *bridge.state().borrow()));

    let config = state.config();
    Json(json!({
        "format": config.stream.format,
        "stream": config.stream_path(),
        "uptime_secs": state.uptime().as_secs(),
        "sessions": sessions,
        "cameras": cameras,
        "encoder": encoder,
    }))
}

/// GET /ui
pub async fn ui(State(state): State<SharedState>) -> Html<String> {
    let config = state.config();
    let path = config.stream_path();
    let body = match config.stream.format {
        OutputFormat::Mpeg1 => format!(
            "<canvas id=\"video\"></canvas>\n\
             <script>\n\
             const url = (location.protocol === 'https:' ? 'wss://' : 'ws://') + location.host + '{}';\n\
             document.getElementById('video').dataset.source = url;\n\
             </script>",
            path
        ),
        OutputFormat::Mjpeg | OutputFormat::MjpegDuo => {
            format!("<img id=\"video\" src=\"{}\" alt=\"live stream\">", path)
        }
    };
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>camrelay</title></head>\n<body>\n{}\n</body>\n</html>\n",
        body
    ))
}
