use crate::config::ApiConfig;
use crate::error::{VectorError, VectorResult};
use crate::geojson::FeatureCollection;
use crate::metadata_store::{DatasetRecord, VectorStore};
use crate::pipeline::IngestionPipeline;
use crate::query::{DatasetMetadata, ItemsQuery, QueryService};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use vector_ingest::{IngestError, SourceArchive};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestionPipeline>,
    pub query: Arc<QueryService>,
    pub store: Arc<dyn VectorStore>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestionPipeline>, store: Arc<dyn VectorStore>, config: &ApiConfig) -> Self {
        let query = Arc::new(QueryService::new(pipeline.clone(), store.clone(), config));
        Self {
            pipeline,
            query,
            store,
        }
    }
}

/// Upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub dataset_id: String,
    /// The archive was retained
    pub stored: bool,
    /// Whether the archive was processed as part of the upload
    pub processed: bool,
    /// Resulting record when processed
    pub dataset: Option<DatasetRecord>,
}

/// Create the API router. Only the read routes are exposed cross-origin.
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let read_methods = [Method::GET, Method::OPTIONS];
    let cors = if config.cors_origin.trim() == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(read_methods)
            .allow_headers(Any)
    } else {
        match config.cors_origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(read_methods)
                .allow_headers(Any),
            Err(_) => {
                warn!(origin = %config.cors_origin, "Ignoring unparseable CORS origin");
                CorsLayer::new()
            }
        }
    };

    let reads = Router::new()
        .route("/vector/:dataset_id/metadata", get(get_metadata))
        .route("/vector/:dataset_id/items", get(get_items))
        .layer(cors);

    // Oversized bodies are refused before they are buffered
    let body_limit = usize::try_from(state.pipeline.config().max_size_bytes()).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/vector/:dataset_id/archive",
            axum::routing::put(upload_archive).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/vector/:dataset_id/activate", post(activate))
        .route("/vector/:dataset_id/deactivate", post(deactivate))
        .route("/vector/:dataset_id", axum::routing::delete(delete_dataset))
        .merge(reads)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "vector-storage"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "database": "disconnected"
                })),
            )
        }
    }
}

#[instrument(skip(state))]
async fn get_metadata(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> VectorResult<Json<DatasetMetadata>> {
    state.query.get_metadata(&dataset_id).await.map(Json)
}

#[instrument(skip(state))]
async fn get_items(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(params): Query<ItemsQuery>,
) -> VectorResult<Json<FeatureCollection>> {
    state.query.get_items(&dataset_id, &params).await.map(Json)
}

#[instrument(skip(state, headers, body))]
async fn upload_archive(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> VectorResult<(StatusCode, Json<UploadResponse>)> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            let limit = state.pipeline.config().max_size_bytes();
            IngestError::TooLarge {
                actual: declared.unwrap_or(limit.saturating_add(1)),
                limit,
            }
        } else {
            IngestError::InvalidArchive(rejection.body_text())
        }
    })?;

    let mut archive = SourceArchive::new(dataset_id.clone(), body);
    if let Some(declared) = declared {
        archive = archive.with_declared_size(declared);
    }

    let dataset = state.pipeline.upload(archive).await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            dataset_id,
            stored: true,
            processed: dataset.is_some(),
            dataset,
        }),
    ))
}

#[instrument(skip(state))]
async fn activate(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> VectorResult<Json<DatasetRecord>> {
    state.pipeline.activate_retained(&dataset_id).await.map(Json)
}

#[instrument(skip(state))]
async fn deactivate(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> VectorResult<StatusCode> {
    state.pipeline.deactivate(&dataset_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
async fn delete_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<StatusCode, VectorError> {
    state.pipeline.on_delete(&dataset_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start the API server; returns once `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting vector API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
