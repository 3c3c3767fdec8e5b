//! HTTP surface for the map front end.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/map_data?bbox=` | Records inside a bounding box |
//! | `GET`  | `/api/comparison` | Technology counts per dataset partition |
//! | `POST` | `/upload` | Parse an uploaded CSV/JSON file and echo its rows |
//! | `GET`  | `/health` | Status, version, record count, public config |
//!
//! Errors use `{ "error": { "code": "bad_request", "message": "..." } }`.

use std::path::Path;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::comparison::{compute_summary, ComparisonSummary};
use crate::config::PublicAppConfig;
use crate::errors::AppError;
use crate::ingestion::{SourceFormat, Table};
use crate::records::{count_records, records_in_bbox, BoundingBox, MapPoint};
use crate::AppState;

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
const UPLOAD_FIELD: &str = "file";

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid filename pattern"));

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/map_data", get(handle_map_data))
        .route("/api/comparison", get(handle_comparison))
        .route("/upload", post(handle_upload))
        .route("/health", get(handle_health))
        .fallback(handle_not_found)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Binds `bind_addr` from the config and serves until the process exits.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&state.config.bind_addr).await?;
    serve_on(listener, state).await
}

pub async fn serve_on(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(target: "server", %addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Parse(_) | AppError::Schema(_) | AppError::Upload(_) => {
                bad_request(err.to_string())
            }
            other => {
                error!(target: "server", err = ?other, "request failed");
                internal(other.to_string())
            }
        }
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ Handlers ============

#[derive(Deserialize)]
struct MapDataQuery {
    bbox: Option<String>,
}

async fn handle_map_data(
    State(state): State<AppState>,
    Query(query): Query<MapDataQuery>,
) -> Result<Json<Vec<MapPoint>>, ApiError> {
    let raw = query
        .bbox
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| bad_request("Bounding box is required"))?;
    let bbox = BoundingBox::parse(&raw)?;
    let points = records_in_bbox(&state.store.lock(), &bbox)?;
    Ok(Json(points))
}

async fn handle_comparison(
    State(state): State<AppState>,
) -> Result<Json<ComparisonSummary>, ApiError> {
    let summary = compute_summary(&state.store.lock())?;
    Ok(Json(summary))
}

#[derive(Serialize)]
struct UploadResponse {
    filename: String,
    data: Vec<Map<String, Value>>,
    total: usize,
}

async fn handle_upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut multipart = multipart.map_err(|_| AppError::Upload("No file uploaded".into()))?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::Upload(err.body_text()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let original_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|err| AppError::Upload(err.body_text()))?;
        upload = Some((original_name, bytes));
        break;
    }

    let (original_name, bytes) = upload.ok_or_else(|| AppError::Upload("No file uploaded".into()))?;
    let filename = sanitize_filename(&original_name);
    if filename.is_empty() {
        return Err(AppError::Upload("No selected file".into()).into());
    }
    let format = SourceFormat::from_file_name(&filename).ok_or_else(|| {
        AppError::Upload("Unsupported file type. Please upload a CSV or JSON file.".into())
    })?;

    tokio::fs::create_dir_all(&state.config.uploads_dir)
        .await
        .map_err(AppError::from)?;
    let saved_path = state.config.uploads_dir.join(&filename);
    tokio::fs::write(&saved_path, &bytes)
        .await
        .map_err(AppError::from)?;
    info!(
        target: "server",
        path = %saved_path.display(),
        bytes = bytes.len(),
        "saved upload"
    );

    let table = match format {
        SourceFormat::Csv => Table::from_csv(&bytes),
        SourceFormat::Json => Table::from_json(&bytes),
    }
    .map_err(|err| AppError::Upload(format!("Could not parse {filename}: {err}")))?;
    let data = table.to_objects();

    Ok(Json(UploadResponse {
        filename,
        total: data.len(),
        data,
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    records: usize,
    database_path: String,
    config: PublicAppConfig,
}

async fn handle_health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let records = count_records(&state.store.lock())?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        records,
        database_path: state.store.path().to_string_lossy().to_string(),
        config: state.config.public_profile(),
    }))
}

async fn handle_not_found() -> ApiError {
    not_found("resource not found")
}

/// Keeps the final path component and replaces anything outside
/// `[A-Za-z0-9._-]`, so uploads can never escape the uploads directory.
fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let base = base.rsplit('\\').next().unwrap_or_default();
    UNSAFE_FILENAME_CHARS
        .replace_all(base, "_")
        .trim_matches(|c| c == '.' || c == '_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_uploaded_names() {
        assert_eq!(sanitize_filename("police data.csv"), "police_data.csv");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\atlas.json"), "atlas.json");
        assert_eq!(sanitize_filename(""), "");
        assert_eq!(sanitize_filename(".."), "");
    }

    #[test]
    fn maps_client_errors_to_bad_request() {
        let err = ApiError::from(AppError::Parse("bad bbox".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let err = ApiError::from(AppError::Schema("City".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let err = ApiError::from(AppError::Upload("No selected file".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "No selected file");
        let err = ApiError::from(AppError::Config("boom".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
