// --- HTTP API ---------------------------------------------------------------
//
// Route names keep the PascalCase style existing clients already call
// (GetNextImage / SaveImage). Queue endpoints follow the same pattern.
//
// Every handler that needs the set of images on disk lists the store *before*
// taking the selector lock, so the lock is only ever held for in-memory work.
// If the listing fails we answer 500 and leave the queues untouched.

use std::sync::Arc;

use axum::{
    extract::{
        multipart::{Multipart, MultipartError, MultipartRejection},
        DefaultBodyLimit, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::selector::{Available, Selector, SelectorError, Source};
use crate::store::{MediaStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub config: Arc<Config>,
    pub store: MediaStore,
    pub selector: Arc<tokio::sync::Mutex<Selector>>,
}

impl AppState {
    pub fn new(config: Config, store: MediaStore, selector: Selector) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config: Arc::new(config),
            store,
            selector: Arc::new(tokio::sync::Mutex::new(selector)),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let images = ServeDir::new(state.store.dir());
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/GetNextImage", get(api_get_next_image))
        .route("/SaveImage", post(api_save_image))
        .route("/ListImages", get(api_list_images))
        .route("/DeleteImage", post(api_delete_image))
        .route("/SendNext", post(api_send_next))
        .route("/SendNextQueue", get(api_send_next_queue))
        .route("/ClearSendNext", post(api_clear_send_next))
        .route("/Loop", post(api_loop_add))
        .route("/Loop/:filename", delete(api_loop_remove))
        .route("/LoopQueue", get(api_loop_queue))
        .route("/ClearLoop", post(api_clear_loop))
        .route("/Fun", post(api_fun))
        .route("/Status", get(api_status))
        .nest_service("/images", images)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "image-api is running. Try /GetNextImage"
}

// --- Errors -------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    NoImages,
    UnknownImage(String),
    NotInLoop(String),
    NoUpload,
    UploadTooLarge,
    Server(anyhow::Error),
}

impl From<SelectorError> for ApiError {
    fn from(e: SelectorError) -> Self {
        match e {
            SelectorError::NoContent => ApiError::NoImages,
            SelectorError::UnknownItem(id) => ApiError::UnknownImage(id),
            SelectorError::NotInLoop(id) => ApiError::NotInLoop(id),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApiError::UnknownImage(id),
            StoreError::Io(e) => ApiError::Server(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NoImages => (StatusCode::NOT_FOUND, "No images found.").into_response(),
            ApiError::UnknownImage(_) => (StatusCode::NOT_FOUND, "Image not found.").into_response(),
            ApiError::NotInLoop(_) => (StatusCode::NOT_FOUND, "Image not in loop.").into_response(),
            ApiError::NoUpload => (StatusCode::BAD_REQUEST, "No image uploaded.").into_response(),
            ApiError::UploadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "Image too large.").into_response(),
            ApiError::Server(e) => {
                warn!("request failed: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Server error.").into_response()
            }
        }
    }
}

/// Snapshot the media directory on the blocking pool.
async fn list_available(store: &MediaStore) -> Result<Available, ApiError> {
    let store = store.clone();
    let ids = tokio::task::spawn_blocking(move || store.list_ids())
        .await
        .map_err(|e| ApiError::Server(anyhow::anyhow!("list task join failed: {e}")))?
        .map_err(ApiError::Server)?;
    Ok(Available::new(ids))
}

// --- Selection ----------------------------------------------------------------

#[derive(Debug, Serialize)]
struct NextImageResponse {
    filename: String,
    url: String,
    source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    fun: Option<bool>,
}

async fn api_get_next_image(State(state): State<AppState>) -> Result<Json<NextImageResponse>, ApiError> {
    let available = list_available(&state.store).await?;

    let picked = state.selector.lock().await.select_next(&available);
    let picked = picked.map_err(|e| {
        info!("GetNextImage: no images found");
        ApiError::from(e)
    })?;

    info!(source = ?picked.source, fun = picked.fun, "GetNextImage: {}", picked.id);
    Ok(Json(NextImageResponse {
        url: state.config.image_url(&picked.id),
        filename: picked.id,
        source: picked.source,
        fun: picked.fun.then_some(true),
    }))
}

// --- Store ----------------------------------------------------------------------

async fn api_save_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut multipart = multipart.map_err(|e| {
        info!("SaveImage: rejected request: {e}");
        ApiError::NoUpload
    })?;

    let mut upload = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                info!("SaveImage: malformed multipart body: {e}");
                return Err(upload_error(&e));
            }
        };
        if field.name() != Some("image") {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| {
            info!("SaveImage: failed to read upload: {e}");
            upload_error(&e)
        })?;
        upload = Some((file_name, bytes));
        break;
    }

    // Browsers send an empty, unnamed part when no file was chosen.
    let (file_name, bytes) = match upload {
        Some((name, bytes)) if !(bytes.is_empty() && name.as_deref().unwrap_or("").is_empty()) => (name, bytes),
        _ => {
            info!("SaveImage: no image uploaded");
            return Err(ApiError::NoUpload);
        }
    };

    let store = state.store.clone();
    let filename = tokio::task::spawn_blocking(move || store.save(file_name.as_deref(), &bytes))
        .await
        .map_err(|e| ApiError::Server(anyhow::anyhow!("save task join failed: {e}")))?
        .map_err(ApiError::Server)?;

    info!("SaveImage: stored {filename}");
    Ok(Json(json!({"message": "Image saved.", "filename": filename})))
}

/// Body-limit hits surface as multipart errors; keep them apart from
/// malformed or empty uploads.
fn upload_error(e: &MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::UploadTooLarge
    } else {
        ApiError::NoUpload
    }
}

async fn api_list_images(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let available = list_available(&state.store).await?;
    Ok(Json(json!({"images": available.ids()})))
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    filename: String,
}

async fn api_delete_image(
    State(state): State<AppState>,
    Json(req): Json<ImageRef>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let id = req.filename.clone();
    tokio::task::spawn_blocking(move || store.remove(&id))
        .await
        .map_err(|e| ApiError::Server(anyhow::anyhow!("remove task join failed: {e}")))??;

    // Queue entries pointing at it go stale and are handled at selection time.
    info!("DeleteImage: archived {}", req.filename);
    Ok(Json(json!({"ok": true})))
}

// --- Queues ---------------------------------------------------------------------

async fn api_send_next(
    State(state): State<AppState>,
    Json(req): Json<ImageRef>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let available = list_available(&state.store).await?;
    let mut sel = state.selector.lock().await;
    sel.enqueue_send_next(&req.filename, &available).map_err(|e| {
        info!("SendNext: {e}");
        ApiError::from(e)
    })?;
    info!("SendNext: queued {}", req.filename);
    Ok(Json(json!({"ok": true, "queue": sel.peek_send_next()})))
}

async fn api_send_next_queue(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sel = state.selector.lock().await;
    Json(json!({"queue": sel.peek_send_next()}))
}

async fn api_clear_send_next(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.selector.lock().await.clear_send_next();
    info!("ClearSendNext");
    Json(json!({"ok": true}))
}

async fn api_loop_add(
    State(state): State<AppState>,
    Json(req): Json<ImageRef>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let available = list_available(&state.store).await?;
    let mut sel = state.selector.lock().await;
    sel.enqueue_loop(&req.filename, &available).map_err(|e| {
        info!("Loop: {e}");
        ApiError::from(e)
    })?;
    info!("Loop: queued {}", req.filename);
    Ok(Json(json!({"ok": true, "queue": sel.peek_loop()})))
}

async fn api_loop_remove(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut sel = state.selector.lock().await;
    sel.remove_from_loop(&filename)?;
    info!("Loop: removed {filename}");
    Ok(Json(json!({"ok": true, "queue": sel.peek_loop()})))
}

async fn api_loop_queue(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sel = state.selector.lock().await;
    Json(json!({"queue": sel.peek_loop()}))
}

async fn api_clear_loop(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.selector.lock().await.clear_loop();
    info!("ClearLoop");
    Json(json!({"ok": true}))
}

async fn api_fun(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.selector.lock().await.trigger_fun();
    info!("Fun: armed for the next image");
    Json(json!({"ok": true}))
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    images: usize,
    send_next: Vec<String>,
    #[serde(rename = "loop")]
    loop_queue: Vec<String>,
    fun_pending: bool,
}

async fn api_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let available = list_available(&state.store).await?;
    let sel = state.selector.lock().await;
    Ok(Json(StatusResponse {
        version: state.version.clone(),
        images: available.len(),
        send_next: sel.peek_send_next(),
        loop_queue: sel.peek_loop(),
        fun_pending: sel.fun_pending(),
    }))
}
