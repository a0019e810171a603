//! HTTP routes: upload form, multipart intake, and the JSON views.

use crate::intake;
use crate::invoice_db::{InvoiceStore, StoredInvoice};
use crate::llm_client::InvoiceModel;
use crate::page_cache::PageCache;
use crate::uploads;
use axum::extract::multipart::MultipartError;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const UPLOAD_SUCCESS_MSG: &str = "Upload completed successfully";

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Mutex<InvoiceStore>>,
    pub model: Arc<dyn InvoiceModel>,
    pub upload_dir: PathBuf,
    /// Serialized JSON bodies of the cached views.
    pub cache: Arc<PageCache<String>>,
}

impl AppState {
    pub fn new(
        store: InvoiceStore,
        model: Arc<dyn InvoiceModel>,
        upload_dir: PathBuf,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            model,
            upload_dir,
            cache: Arc::new(PageCache::new(cache_ttl)),
        }
    }

    fn store(&self) -> Result<MutexGuard<'_, InvoiceStore>, ApiError> {
        self.store.lock().map_err(|_| ApiError::Internal("database lock poisoned".into()))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{}", .0.body_text())]
    Multipart(#[from] MultipartError),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Multipart(e) => e.status(),
            ApiError::Db(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build application router
pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/upload", get(upload_page).post(upload))
        .route("/upload/:filename", get(download))
        .route("/records", get(records))
        .route("/duplicates", get(duplicates))
        .route("/api/invoices/:id", get(get_invoice))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Upload form
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    msg: Option<String>,
}

fn escape_html(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '&' => "&amp;".to_string(),
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#39;".to_string(),
            c => c.to_string(),
        })
        .collect()
}

fn upload_form(msg: Option<&str>) -> Html<String> {
    let banner = msg
        .map(|m| format!("<p class=\"msg\">{}</p>\n", escape_html(m)))
        .unwrap_or_default();
    Html(format!(
        "<!doctype html>
<html>
<head><title>Invoice upload</title></head>
<body>
<h1>Upload PDF invoices</h1>
{banner}<form action=\"/upload\" method=\"post\" enctype=\"multipart/form-data\">
<input type=\"file\" name=\"files\" accept=\"application/pdf\" multiple>
<button type=\"submit\">Upload</button>
</form>
<p><a href=\"/records\">Records</a> | <a href=\"/duplicates\">Duplicates</a></p>
</body>
</html>
"
    ))
}

async fn home() -> Html<String> {
    upload_form(None)
}

async fn upload_page(Query(query): Query<UploadQuery>) -> Html<String> {
    upload_form(query.msg.as_deref())
}

// ---------------------------------------------------------------------------
// Multipart intake
// ---------------------------------------------------------------------------

/// POST /upload
///
/// Saves every `files` part, records it, then runs each through the
/// model. One failing file does not stop the others. A request that is
/// not `multipart/form-data` at all counts as carrying no files.
async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let Ok(mut multipart) = multipart else {
        return Err(ApiError::BadRequest("No files provided".into()));
    };
    let mut received = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("files") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await?;
        // Browsers send one empty part when nothing was selected
        if file_name.is_empty() && bytes.is_empty() {
            continue;
        }
        received.push((file_name, bytes));
    }

    if received.is_empty() {
        return Err(ApiError::BadRequest("No files provided".into()));
    }

    let mut saved = Vec::with_capacity(received.len());
    for (file_name, bytes) in &received {
        let path = uploads::save_upload(&state.upload_dir, file_name, bytes)
            .await
            .map_err(|e| ApiError::Internal(format!("failed to save upload: {e}")))?;
        let stored_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let record = state
            .store()?
            .insert_uploaded_file(&stored_name, &path.to_string_lossy())?;
        saved.push(record);
    }

    let mut failures = 0usize;
    for record in &saved {
        match intake::process_upload(state.model.as_ref(), &state.store, record).await {
            Ok(invoice) => {
                info!(invoice_id = %invoice.invoice_id, file = %record.file_name, "Invoice processed");
            }
            Err(e) => {
                failures += 1;
                warn!(file = %record.file_name, error = %e, "Invoice processing failed");
            }
        }
    }

    if failures < saved.len() {
        state.cache.invalidate_all();
    }

    let msg = if failures == 0 {
        UPLOAD_SUCCESS_MSG.to_string()
    } else {
        format!("Upload completed with {failures} of {} files failing", saved.len())
    };
    Ok(Redirect::to(&format!("/upload?msg={}", urlencoding::encode(&msg))).into_response())
}

/// GET /upload/:filename
async fn download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let safe = uploads::secure_filename(&filename);
    let path = state.upload_dir.join(&safe);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "application/pdf")], bytes).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ApiError::NotFound(safe)),
        Err(e) => Err(ApiError::Internal(format!("failed to read upload: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

fn json_body(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// Serve `key` from the page cache, filling it from `load` on a miss.
fn cached_view(
    state: &AppState,
    key: &str,
    load: impl FnOnce(&InvoiceStore) -> rusqlite::Result<Vec<StoredInvoice>>,
) -> Result<Response, ApiError> {
    if let Some(body) = state.cache.get(key) {
        return Ok(json_body(body));
    }
    // Taken before the read so an upload landing in between wins
    let generation = state.cache.generation();
    let invoices = {
        let store = state.store()?;
        load(&*store)?
    };
    let body = serde_json::to_string(&invoices)
        .map_err(|e| ApiError::Internal(format!("failed to encode response: {e}")))?;
    state.cache.insert_if_current(key, body.clone(), generation);
    Ok(json_body(body))
}

/// GET /records
async fn records(State(state): State<AppState>) -> Result<Response, ApiError> {
    cached_view(&state, "/records", InvoiceStore::list_invoices)
}

/// GET /duplicates
async fn duplicates(State(state): State<AppState>) -> Result<Response, ApiError> {
    cached_view(&state, "/duplicates", InvoiceStore::find_duplicates)
}

/// GET /api/invoices/:id
async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StoredInvoice>, ApiError> {
    let store = state.store()?;
    store
        .get_invoice(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("invoice {id}")))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
}

/// GET /health
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
