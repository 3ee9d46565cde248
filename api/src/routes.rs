/// HTTP route handlers for Fetchgate.
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use fetchgate_downloader::HttpClient;
use fetchgate_shared::models::{FileMetadata, MergedArtifact, StoredUpload, TransferStatus};

use crate::error::ApiError;
use crate::range::RangeReply;
use crate::AppState;

// ====== REQUEST TYPES ======

#[derive(Deserialize)]
pub struct MergeBody {
    #[serde(alias = "fileId")]
    pub transfer_id: String,
    pub filename: String,
    pub total: u32,
}

#[derive(Deserialize)]
pub struct StatusQuery {
    #[serde(alias = "fileId")]
    pub transfer_id: String,
    pub total: Option<u32>,
}

/// Build the application router.
pub fn router<C: HttpClient>(state: Arc<AppState<C>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let uploads = Router::new()
        .route("/upload", post(upload::<C>))
        .route("/upload/chunk", post(upload_chunk::<C>))
        .layer(DefaultBodyLimit::max(state.config.max_chunk_bytes));

    Router::new()
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .merge(uploads)
        .route("/upload/merge", post(merge_chunks::<C>))
        .route("/upload/status", get(upload_status::<C>))
        .route("/download/:file", get(download::<C>))
        .route("/download/range/:file", get(download_range::<C>))
        .route("/meta/:file", get(file_meta::<C>))
        .fallback(proxy::<C>)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ====== PROXY ======

/// Any other GET: resolve against the upstream candidates. HEAD stops once
/// an upstream is found.
pub async fn proxy<C: HttpClient>(State(state): State<Arc<AppState<C>>>, method: Method, uri: Uri) -> Response {
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let outcome = if method == Method::GET {
        state.orchestrator.handle(path_and_query, &state.shutdown).await
    } else if method == Method::HEAD {
        state.orchestrator.handle_head(path_and_query, &state.shutdown).await
    } else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };
    match outcome {
        Ok(reply) => reply.into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ====== UPLOADS ======

fn multipart_error(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::bad_request(format!("Malformed multipart body: {}", e))
}

fn parse_field<T: std::str::FromStr>(name: &str, value: Option<String>) -> Result<T, ApiError> {
    let value = value.ok_or_else(|| ApiError::bad_request(format!("Missing field: {}", name)))?;
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid {}: {:?}", name, value)))
}

/// POST /upload/chunk - store one chunk of a transfer
pub async fn upload_chunk<C: HttpClient>(
    State(state): State<Arc<AppState<C>>>,
    mut multipart: Multipart,
) -> Result<Json<TransferStatus>, ApiError> {
    let mut transfer_id = None;
    let mut index = None;
    let mut total = None;
    let mut filename = None;
    let mut payload: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => payload = Some(field.bytes().await.map_err(multipart_error)?),
            "transfer_id" | "fileId" => transfer_id = Some(field.text().await.map_err(multipart_error)?),
            "index" => index = Some(field.text().await.map_err(multipart_error)?),
            "total" => total = Some(field.text().await.map_err(multipart_error)?),
            "filename" => filename = Some(field.text().await.map_err(multipart_error)?),
            _ => {}
        }
    }

    let transfer_id = transfer_id.ok_or_else(|| ApiError::bad_request("Missing field: transfer_id"))?;
    let index: u32 = parse_field("index", index)?;
    let total: u32 = parse_field("total", total)?;
    let payload = payload.ok_or_else(|| ApiError::bad_request("Missing field: file"))?;
    let filename = filename.filter(|f| !f.trim().is_empty());

    let status = state
        .assembler
        .put_chunk(transfer_id.trim(), index, total, filename.as_deref(), payload)
        .await?;
    Ok(Json(status))
}

/// POST /upload/merge - concatenate a complete transfer
pub async fn merge_chunks<C: HttpClient>(
    State(state): State<Arc<AppState<C>>>,
    Json(body): Json<MergeBody>,
) -> Result<Json<MergedArtifact>, ApiError> {
    let merged = state
        .assembler
        .merge(body.transfer_id.trim(), &body.filename, body.total)
        .await?;
    Ok(Json(merged))
}

/// GET /upload/status?transfer_id=...
pub async fn upload_status<C: HttpClient>(
    State(state): State<Arc<AppState<C>>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<TransferStatus>, ApiError> {
    let status = state
        .assembler
        .status(query.transfer_id.trim(), query.total)
        .await?;
    Ok(Json(status))
}

/// POST /upload - store one or more `file` parts as they are
pub async fn upload<C: HttpClient>(
    State(state): State<Arc<AppState<C>>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<StoredUpload>>), ApiError> {
    let mut stored = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request("File part has no file name"))?;
        stored.push(state.assembler.store_upload(&filename, field).await?);
    }

    if stored.is_empty() {
        return Err(ApiError::bad_request("No file parts in request"));
    }
    Ok((StatusCode::CREATED, Json(stored)))
}

// ====== DOWNLOADS ======

/// GET /download/:file - whole file as an attachment
pub async fn download<C: HttpClient>(
    State(state): State<Arc<AppState<C>>>,
    Path(file): Path<String>,
) -> Result<RangeReply, ApiError> {
    Ok(state.range.serve(&file, None).await?)
}

/// GET /download/range/:file - honors the Range header
pub async fn download_range<C: HttpClient>(
    State(state): State<Arc<AppState<C>>>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> Result<RangeReply, ApiError> {
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    Ok(state.range.serve(&file, range).await?)
}

/// GET /meta/:file
pub async fn file_meta<C: HttpClient>(
    State(state): State<Arc<AppState<C>>>,
    Path(file): Path<String>,
) -> Result<Json<FileMetadata>, ApiError> {
    Ok(Json(state.range.metadata(&file).await?))
}
