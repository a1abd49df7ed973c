use axum::extract::rejection::JsonRejection;
use axum::response::sse::{Event, KeepAlive};
use axum::{
    extract::{Path, State},
    http as ax_http, middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::emitter::StreamEmitter;
use crate::health;
use crate::logging::request_id_middleware;
use crate::redaction::{redact_value, RedactionLevel};
use crate::types::{FileSet, GenerationRequest, ObservedError, Result, SitesmithError};
use crate::AppState;

const EVENT_BUFFER: usize = 64;

pub fn router(state: Arc<AppState>) -> Router {
    let max_body = state.args.max_body_size;
    Router::new()
        .route("/api/generate", post(generate_handler))
        .route("/api/fragments/:id/export", get(export_fragment))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .route(
            "/admin/projects/:project_id/fragments",
            get(health::admin_fragments),
        )
        .route("/debug/providers", get(health::debug_providers))
        .layer(axum::extract::DefaultBodyLimit::max(max_body))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<GenerationRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(r)) => r,
        Err(rejection) => {
            tracing::warn!("[🌐 -> ⚙️ ] Rejected generate body: {}", rejection.body_text());
            return ObservedError::from(SitesmithError::InvalidRequest(rejection.body_text())).into_response();
        }
    };

    if let Err(e) = request.validate() {
        tracing::warn!("[🌐 -> ⚙️ ] Invalid generate request: {}", e);
        return e.into_response();
    }

    if let Ok(mut logged) = serde_json::to_value(&request) {
        redact_value(&mut logged, RedactionLevel::default());
        tracing::info!(target: "flight_recorder", "[REQ] generate {}", logged);
    }

    let (mut emitter, rx) = StreamEmitter::channel(EVENT_BUFFER);
    let pipeline = state.pipeline();
    let span = tracing::info_span!(
        "generate",
        project = %request.project_id,
        provider = %request.provider,
        resume = request.resume_seed().is_some()
    );

    tokio::spawn(
        async move {
            pipeline.run(request, &mut emitter).await;
        }
        .instrument(span),
    );

    let events = ReceiverStream::new(rx)
        .map(|event| serde_json::to_string(&event).map(|json| Event::default().data(json)));

    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text(": keepalive"),
        )
        .into_response()
}

pub async fn export_fragment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let fragment = match state.store.fragment(&id).await {
        Ok(Some(f)) => f,
        Ok(None) => {
            return (ax_http::StatusCode::NOT_FOUND, "Fragment not found").into_response();
        }
        Err(e) => return e.into_response(),
    };

    let archive = match zip_files(&fragment.files) {
        Ok(bytes) => bytes,
        Err(e) => return e.into_response(),
    };

    (
        ax_http::StatusCode::OK,
        [
            (ax_http::header::CONTENT_TYPE, "application/zip".to_string()),
            (
                ax_http::header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"site-{}.zip\"", crate::str_utils::prefix_chars(&fragment.id, 8)),
            ),
        ],
        archive,
    )
        .into_response()
}

pub fn zip_files(files: &FileSet) -> Result<Vec<u8>> {
    let mut zip_buffer = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_buffer));
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for (path, content) in files.iter() {
            zip.start_file(path, options)
                .map_err(|e| SitesmithError::internal(format!("zip entry {} failed: {}", path, e)))?;
            zip.write_all(content.as_bytes())?;
        }
        zip.finish()
            .map_err(|e| SitesmithError::internal(format!("zip finish failed: {}", e)))?;
    }
    Ok(zip_buffer)
}
