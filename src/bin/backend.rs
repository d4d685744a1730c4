#![forbid(unsafe_code)]

//! HTTP front of the ApsaraFlow gateway.
//!
//! Routes:
//! * `GET /` liveness.
//! * `GET /api/info` resolves a URL and returns its descriptor.
//! * `GET /api/download` runs the download pipeline and streams the result.
//! * `GET /api/health` reports toolchain presence and gate usage.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use apsaraflow::{
    config::{GatewaySettings, SettingsOverrides, resolve_settings},
    delivery::Delivery,
    descriptor::ResourceDescriptor,
    error::GatewayError,
    filename::content_disposition,
    gate::AdmissionGate,
    pipeline::Pipeline,
    request::{CombineMode, EncodingSelector, TransformRequest},
    resolver::{ResolveDepth, ResourceResolver, YtDlpMetadataSource},
    security::{ensure_not_root, validate_source_url},
    strategy,
    toolchain::{ToolStatus, Toolchain},
    workspace::WorkspaceManager,
};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize, de};
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const COLLECTION_ITEMS_HEADER: &str = "x-collection-items";
const COLLECTION_SKIPPED_HEADER: &str = "x-collection-skipped";
const COLLECTION_TRUNCATED_HEADER: &str = "x-collection-truncated";

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Media-fetch gateway HTTP server")]
struct BackendArgs {
    /// Address to listen on (overrides APSARAFLOW_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides APSARAFLOW_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Download pipelines allowed to run at once.
    #[arg(long)]
    max_concurrent_downloads: Option<usize>,
    /// Directory for per-request scratch workspaces.
    #[arg(long)]
    scratch_root: Option<PathBuf>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> SettingsOverrides {
        SettingsOverrides {
            host: self.host,
            port: self.port,
            max_concurrent_downloads: self.max_concurrent_downloads,
            scratch_root: self.scratch_root,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/APSARAFLOW_HOST")
}

/// Shared state handed to every handler. The gate is created once here and
/// nowhere else.
#[derive(Clone)]
struct AppState {
    settings: Arc<GatewaySettings>,
    gate: AdmissionGate,
    resolver: Arc<ResourceResolver<YtDlpMetadataSource>>,
    pipeline: Arc<Pipeline>,
    started_at: DateTime<Utc>,
}

impl AppState {
    fn new(settings: GatewaySettings) -> Self {
        let toolchain = Toolchain::new(
            settings.fetch_program.clone(),
            settings.encoder_program.clone(),
        );
        let pipeline = Pipeline::new(
            toolchain.clone(),
            WorkspaceManager::new(settings.scratch_root.clone()),
            settings.process_exit_timeout,
        );
        Self {
            gate: AdmissionGate::new(settings.max_concurrent_downloads),
            resolver: Arc::new(ResourceResolver::new(YtDlpMetadataSource::new(toolchain))),
            pipeline: Arc::new(pipeline),
            settings: Arc::new(settings),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::AdmissionRejected => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Resolution(_) | GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::ToolchainMissing { .. }
            | GatewayError::ToolchainFailure { .. }
            | GatewayError::InternalConsistency(_)
            | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if err.is_client_error() {
            warn!(status = status.as_u16(), error = %err, "request rejected");
        } else {
            error!(status = status.as_u16(), error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        warn!(error = %rejection.body_text(), "malformed query");
        Self {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("apsaraflow=info,backend=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|value| value.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = resolve_settings(BackendArgs::parse().into_overrides())?;
    if !settings.allow_root {
        ensure_not_root("backend")?;
    }

    let host = parse_host_arg(&settings.host)?;
    let addr = SocketAddr::new(host, settings.port);
    let state = AppState::new(settings);

    if let Err(err) = state.pipeline.toolchain().ensure_available() {
        warn!(error = %err, "toolchain incomplete, downloads will fail until it is installed");
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running gateway server")?;

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_DISPOSITION,
            header::CONTENT_LENGTH,
            HeaderName::from_static(COLLECTION_ITEMS_HEADER),
            HeaderName::from_static(COLLECTION_SKIPPED_HEADER),
            HeaderName::from_static(COLLECTION_TRUNCATED_HEADER),
        ]);

    Router::new()
        .route("/", get(root))
        .route("/api/info", get(fetch_info))
        .route("/api/download", get(download))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Query flags accept the usual spellings: `1`/`0`, `true`/`false`,
/// `yes`/`no` and `on`/`off`, case-insensitively. An empty value is false.
fn query_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(de::Error::custom(format!("invalid boolean flag: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
struct InfoQuery {
    url: String,
    #[serde(default, deserialize_with = "query_flag")]
    allow_large_playlist: bool,
    max_items: Option<usize>,
}

async fn fetch_info(
    State(state): State<AppState>,
    query: Result<Query<InfoQuery>, QueryRejection>,
) -> ApiResult<Json<ResourceDescriptor>> {
    let Query(query) = query?;
    let url = validate_source_url(&query.url)?;
    let limit = state
        .settings
        .playlist_limit(query.max_items, query.allow_large_playlist);
    let descriptor = state
        .resolver
        .resolve(&url, ResolveDepth::Detailed { limit })
        .await?;
    Ok(Json(descriptor))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    url: String,
    format: Option<String>,
    #[serde(default, deserialize_with = "query_flag")]
    convert_to_mp3: bool,
    filename_template: Option<String>,
    playlist_combine: Option<String>,
    #[serde(default, deserialize_with = "query_flag")]
    karaoke: bool,
    #[serde(default, deserialize_with = "query_flag")]
    allow_large_playlist: bool,
    max_items: Option<usize>,
}

impl DownloadQuery {
    fn transform_request(&self) -> ApiResult<TransformRequest> {
        let request = TransformRequest {
            selector: EncodingSelector::parse(self.format.as_deref())?,
            audio_extract: self.convert_to_mp3,
            filename_template: self.filename_template.clone(),
            combine: CombineMode::parse(self.playlist_combine.as_deref())?,
            vocal_removal: self.karaoke,
        };
        request.validate_flags()?;
        Ok(request)
    }
}

async fn download(
    State(state): State<AppState>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let request = query.transform_request()?;

    // Held until the body is gone; every early return below drops it.
    let token = state.gate.acquire(state.settings.admission_timeout).await?;

    let url = validate_source_url(&query.url)?;
    let limit = state
        .settings
        .playlist_limit(query.max_items, query.allow_large_playlist);
    let descriptor = state
        .resolver
        .resolve(&url, ResolveDepth::Shallow { limit })
        .await?;
    let plan = strategy::select(&descriptor, &request)?;
    info!(
        id = %descriptor.id,
        title = %descriptor.display_title(),
        strategy = ?plan.strategy,
        in_flight = state.gate.in_flight(),
        "download started"
    );

    let output = state.pipeline.execute(&descriptor, &plan, &request).await?;
    let delivery = output.into_delivery(token).await?;
    delivery_response(delivery)
}

fn delivery_response(delivery: Delivery) -> ApiResult<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header_value(&delivery.content_type)?);
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(&delivery.filename))?,
    );
    if let Some(length) = delivery.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Some(summary) = delivery.summary {
        headers.insert(COLLECTION_ITEMS_HEADER, HeaderValue::from(summary.items));
        headers.insert(COLLECTION_SKIPPED_HEADER, HeaderValue::from(summary.skipped));
        headers.insert(
            COLLECTION_TRUNCATED_HEADER,
            HeaderValue::from_static(if summary.truncated { "true" } else { "false" }),
        );
    }

    Ok((StatusCode::OK, headers, Body::from_stream(delivery.body)).into_response())
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| ApiError::internal(format!("invalid header value {value:?}: {err}")))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    yt_dlp: ToolStatus,
    ffmpeg: ToolStatus,
    max_concurrent_downloads: usize,
    in_flight_downloads: usize,
    playlist_default_items: usize,
    playlist_max_items: usize,
    started_at: DateTime<Utc>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let toolchain = state.pipeline.toolchain();
    let (yt_dlp, ffmpeg) = tokio::join!(toolchain.fetch_status(), toolchain.encoder_status());
    Json(HealthResponse {
        status: "ok",
        yt_dlp,
        ffmpeg,
        max_concurrent_downloads: state.gate.capacity(),
        in_flight_downloads: state.gate.in_flight(),
        playlist_default_items: state.settings.playlist_default_items,
        playlist_max_items: state.settings.playlist_max_items,
        started_at: state.started_at,
    })
}
