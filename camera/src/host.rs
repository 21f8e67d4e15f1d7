use std::{
    collections::BTreeMap,
    convert::Infallible,
    future::IntoFuture,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use coffeecam_common::{
    apply_control, report_level, restore_sensor, CaptureOutput, ChunkSink, ControlOutcome,
    ControlRequest, FramePipeline, ImageCodec, OwnedFrame, ReportConfig, ReportError,
    ReportResponse, ReportTransport, RunningAverage, RuntimeConfig, Sensor, SettingsStore,
    SettingsTable, SharedSettings, SharedTiming, SimulatedSensor, SinkError, Slot, StatusReport,
    StoreError, StreamConfig, SETTINGS_SLOTS, STREAM_CONTENT_TYPE,
};

use crate::sim::SimulatedCamera;

const INDEX_HTML_GZ: &[u8] = include_bytes!("../web/index.html.gz");
const STREAM_CHANNEL_DEPTH: usize = 8;

#[derive(Clone)]
struct AppState {
    settings: SharedSettings,
    sensor: Arc<Mutex<SimulatedSensor>>,
    camera: SimulatedCamera,
    timing: SharedTiming,
    store: Arc<FileSettingsStore>,
    stream: StreamConfig,
}

/// Settings table persisted as a JSON map of slot name to byte.
struct FileSettingsStore {
    path: PathBuf,
    bytes: Mutex<[u8; SETTINGS_SLOTS]>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("COFFEECAM_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.coffeecam"));

    let mut runtime = load_runtime_config(&data_dir).await.unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    if let Ok(url) = std::env::var("COFFEECAM_REPORT_URL") {
        runtime.report.url = url;
    }
    runtime.sanitize();

    let store = FileSettingsStore::new(data_dir.join("settings.json"));
    let table = store.load().unwrap_or_else(|err| {
        warn!("failed to load settings table: {err}");
        SettingsTable::default()
    });

    let mut sensor = SimulatedSensor::default();
    let rejected = restore_sensor(&mut sensor, &table);
    if rejected > 0 {
        warn!("{rejected} persisted sensor settings were rejected");
    }
    let sensor = Arc::new(Mutex::new(sensor));

    let mut camera = SimulatedCamera::new(sensor.clone());
    if let Ok(dir) = std::env::var("COFFEECAM_FRAME_DIR") {
        match SimulatedCamera::load_replay_dir(Path::new(&dir)) {
            Ok(frames) if !frames.is_empty() => camera = camera.with_replay(frames),
            Ok(_) => warn!("no JPEG frames in {dir}, using synthetic frames"),
            Err(err) => warn!("failed to load replay frames: {err:#}"),
        }
    }

    let app_state = AppState {
        settings: Arc::new(Mutex::new(table)),
        sensor,
        camera,
        timing: Arc::new(Mutex::new(RunningAverage::new(runtime.stream.timing_depth))),
        store: Arc::new(store),
        stream: runtime.stream,
    };

    spawn_report_loop(app_state.clone(), runtime.report.clone());

    let cors = SetResponseHeaderLayer::overriding(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    let app = Router::new()
        .route("/status", get(handle_status))
        .route("/control", get(handle_control))
        .route_layer(cors)
        .route("/", get(handle_index))
        .route("/capture", get(handle_capture))
        .with_state(app_state.clone());
    let stream_app = Router::new()
        .route("/stream", get(handle_stream))
        .with_state(app_state);

    let port = std::env::var("COFFEECAM_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let stream_addr = SocketAddr::from(([0, 0, 0, 0], port.wrapping_add(1)));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web server at {addr}"))?;
    let stream_listener = TcpListener::bind(stream_addr)
        .await
        .with_context(|| format!("failed to bind stream server at {stream_addr}"))?;

    info!("web server listening on http://{addr}");
    info!("stream server listening on http://{stream_addr}/stream");
    tokio::try_join!(
        axum::serve(listener, app).into_future(),
        axum::serve(stream_listener, stream_app).into_future(),
    )?;
    Ok(())
}

impl AppState {
    fn pipeline(&self) -> FramePipeline<SimulatedCamera, ImageCodec> {
        FramePipeline::new(
            self.camera.clone(),
            ImageCodec,
            self.settings.clone(),
            self.timing.clone(),
            self.stream,
        )
    }
}

async fn handle_index() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/html"),
            (header::CONTENT_ENCODING, "gzip"),
        ],
        INDEX_HTML_GZ,
    )
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let sensor = state.sensor.lock().unwrap().status();
    let status = StatusReport::build(&sensor, &state.settings.lock().unwrap());
    Json(status)
}

async fn handle_control(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let request = match ControlRequest::from_query(query.as_deref().unwrap_or_default()) {
        Ok(request) => request,
        Err(err) => {
            warn!("rejected control query: {err}");
            return error_response(StatusCode::NOT_FOUND, &err.to_string());
        }
    };

    let outcome = tokio::task::spawn_blocking(move || {
        let mut sensor = state.sensor.lock().unwrap();
        let mut table = state.settings.lock().unwrap();
        apply_control(&request, &mut *sensor, &mut table, state.store.as_ref())
    })
    .await;

    match outcome {
        Ok(ControlOutcome::Rejected(err)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
        Ok(ControlOutcome::Applied | ControlOutcome::Ignored) => StatusCode::OK.into_response(),
        Err(err) => {
            warn!("control task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Control task failed")
        }
    }
}

async fn handle_capture(State(state): State<AppState>) -> Response {
    let captured = tokio::task::spawn_blocking(move || state.pipeline().capture()).await;

    let output = match captured {
        Ok(Ok(output)) => output,
        Ok(Err(reason)) => {
            warn!("capture failed: {reason}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Camera capture failed");
        }
        Err(err) => {
            warn!("capture task failed: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Camera capture failed");
        }
    };

    capture_response(output)
}

fn capture_response(output: CaptureOutput<OwnedFrame>) -> Response {
    let mut parts = CollectSink::default();
    if let Err(err) = output.write_to(&mut parts) {
        warn!("failed to buffer capture: {err}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Camera capture failed");
    }
    info!("JPG: {}B", output.payload.len());

    let body = if output.chunked {
        let chunks = parts.0.into_iter().map(Ok::<_, Infallible>);
        Body::from_stream(tokio_stream::iter(chunks))
    } else {
        Body::from(parts.0.concat())
    };

    (
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CONTENT_DISPOSITION, "inline; filename=capture.jpg"),
        ],
        body,
    )
        .into_response()
}

async fn handle_stream(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(STREAM_CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        info!("stream client connected");
        let mut sink = ChannelSink { tx };
        let summary = state.pipeline().run_stream(&mut sink);
        info!(
            "stream closed after {} parts ({} skipped): {:?}",
            summary.parts_sent, summary.frames_skipped, summary.end
        );
    });

    (
        [(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)],
        Body::from_stream(ReceiverStream::new(rx)),
    )
}

#[derive(Default)]
struct CollectSink(Vec<Bytes>);

impl ChunkSink for CollectSink {
    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.0.push(Bytes::copy_from_slice(chunk));
        Ok(())
    }
}

/// Hands chunks from the blocking pipeline thread to the response body.
struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
}

impl ChunkSink for ChannelSink {
    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(chunk)))
            .map_err(|_| SinkError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn spawn_report_loop(state: AppState, report: ReportConfig) {
    if !report.enabled {
        info!("level reporting disabled");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(report.interval_secs));
        loop {
            ticker.tick().await;

            let state = state.clone();
            let report = report.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut transport = UreqTransport::new(Duration::from_millis(report.timeout_ms));
                report_level(
                    &mut state.pipeline(),
                    &state.settings,
                    &mut transport,
                    &report.url,
                )
            })
            .await;

            match result {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!("level report failed: {err}"),
                Err(err) => warn!("level report task failed: {err}"),
            }
        }
    });
}

struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl ReportTransport for UreqTransport {
    fn get(&mut self, url: &str) -> Result<ReportResponse, ReportError> {
        match self.agent.get(url).call() {
            Ok(response) => {
                let status = response.status();
                let body = response
                    .into_string()
                    .map_err(|err| ReportError::Transport(err.to_string()))?;
                Ok(ReportResponse { status, body })
            }
            Err(ureq::Error::Status(status, response)) => Ok(ReportResponse {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(err) => Err(ReportError::Transport(err.to_string())),
        }
    }
}

impl FileSettingsStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            bytes: Mutex::new(*SettingsTable::default().bytes()),
        }
    }

    fn write_file(&self, bytes: &[u8; SETTINGS_SLOTS]) -> Result<(), StoreError> {
        let named: BTreeMap<&str, u8> = Slot::ALL
            .into_iter()
            .map(|slot| (slot.name(), bytes[slot.address()]))
            .collect();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&named)?)?;
        Ok(())
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> Result<SettingsTable, StoreError> {
        let mut bytes = self.bytes.lock().unwrap();
        match std::fs::read(&self.path) {
            Ok(raw) => {
                let named: BTreeMap<String, u8> = serde_json::from_slice(&raw)?;
                for (name, value) in named {
                    match Slot::from_name(&name) {
                        Some(slot) => bytes[slot.address()] = value,
                        None => warn!("ignoring unknown setting `{name}`"),
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no settings at {}, using defaults", self.path.display());
            }
            Err(err) => return Err(err.into()),
        }
        Ok(SettingsTable::from_bytes(*bytes))
    }

    fn commit(&self, writes: &[(Slot, u8)]) -> Result<(), StoreError> {
        let mut bytes = self.bytes.lock().unwrap();
        for (slot, value) in writes {
            bytes[slot.address()] = *value;
        }
        self.write_file(&bytes)
    }
}

async fn load_runtime_config(data_dir: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(data_dir.join("runtime.json")).await {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
