use std::collections::HashMap;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::spawn;
use tracing::{error, info};

use crate::{
    app_state::AppState,
    engine::RagEngine,
    error::RagError,
    ingest,
    models::{DocProcessingStatus, DocStatus, KnowledgeGraph, QueryParam},
    shared::PipelineStatus,
    tags::{tags_from_value, Tags},
    utils::generate_track_id,
};

type ApiError = (StatusCode, Json<Value>);

fn api_error(e: RagError) -> ApiError {
    let status = match e {
        RagError::Validation(_) | RagError::TagFilterType(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Error en la API: {e}");
    }
    (status, Json(json!({ "error": e.to_string(), "kind": e.kind() })))
}

fn parse_tags(raw: Option<Value>) -> Result<Option<Tags>, ApiError> {
    raw.map(|v| tags_from_value(&v)).transpose().map_err(api_error)
}

// --- Payloads y respuestas ---

#[derive(Deserialize)]
pub struct InsertTextPayload {
    text: String,
    #[serde(default)]
    file_source: Option<String>,
    #[serde(default)]
    tags: Option<Value>,
}

#[derive(Deserialize)]
pub struct InsertTextsPayload {
    texts: Vec<String>,
    #[serde(default)]
    file_sources: Option<Vec<String>>,
    #[serde(default)]
    tags: Option<Value>,
}

#[derive(Serialize)]
pub struct InsertResponse {
    status: &'static str,
    message: String,
    track_id: String,
}

#[derive(Deserialize)]
pub struct QueryPayload {
    query: String,
    #[serde(flatten)]
    param: QueryParam,
}

#[derive(Serialize)]
pub struct QueryResponse {
    response: String,
}

#[derive(Deserialize)]
pub struct GraphQuery {
    label: String,
    #[serde(default = "default_max_depth")]
    max_depth: usize,
    #[serde(default = "default_max_nodes")]
    max_nodes: usize,
}

fn default_max_depth() -> usize {
    3
}

fn default_max_nodes() -> usize {
    1000
}

#[derive(Serialize)]
pub struct DocsResponse {
    documents: HashMap<String, DocProcessingStatus>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/documents/text", post(insert_text_handler))
        .route("/documents/texts", post(insert_texts_handler))
        .route("/documents/scan", post(scan_handler))
        .route("/documents/status/:status", get(docs_by_status_handler))
        .route("/documents/track/:track_id", get(docs_by_track_handler))
        .route("/documents/status_counts", get(status_counts_handler))
        .route("/pipeline/status", get(pipeline_status_handler))
        .route("/query", post(query_handler))
        .route("/graphs", get(graph_handler))
        .route("/graph/labels", get(labels_handler))
        .route("/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

/// Lanza el procesado de la cola en segundo plano.
fn spawn_processing(engine: std::sync::Arc<RagEngine>) {
    spawn(async move {
        match engine.process_enqueued().await {
            Ok(report) if report.deferred => info!("Procesado aplazado: pipeline ocupado."),
            Ok(report) => info!(
                "Procesado terminado: {} ok, {} fallidos",
                report.processed.len(),
                report.failed.len()
            ),
            Err(e) => error!("Error procesando la cola: {e}"),
        }
    });
}

// --- Handlers ---

#[axum::debug_handler]
async fn insert_text_handler(
    State(state): State<AppState>,
    Json(payload): Json<InsertTextPayload>,
) -> Result<Json<InsertResponse>, ApiError> {
    let tags = parse_tags(payload.tags)?;
    let track_id = state
        .engine
        .enqueue(
            vec![payload.text],
            payload.file_source.map(|f| vec![f]),
            tags,
            None,
        )
        .await
        .map_err(api_error)?;
    spawn_processing(state.engine.clone());
    Ok(Json(InsertResponse {
        status: "success",
        message: "Documento encolado para su procesado.".to_string(),
        track_id,
    }))
}

#[axum::debug_handler]
async fn insert_texts_handler(
    State(state): State<AppState>,
    Json(payload): Json<InsertTextsPayload>,
) -> Result<Json<InsertResponse>, ApiError> {
    let tags = parse_tags(payload.tags)?;
    let count = payload.texts.len();
    let track_id = state
        .engine
        .enqueue(payload.texts, payload.file_sources, tags, None)
        .await
        .map_err(api_error)?;
    spawn_processing(state.engine.clone());
    Ok(Json(InsertResponse {
        status: "success",
        message: format!("{count} documentos encolados para su procesado."),
        track_id,
    }))
}

#[axum::debug_handler]
async fn scan_handler(State(state): State<AppState>) -> impl IntoResponse {
    let track_id = generate_track_id("scan");
    let engine = state.engine.clone();
    let dir = state.config.input_dir.clone();
    let tid = track_id.clone();
    spawn(async move {
        match ingest::scan_directory(&engine, &dir, &tid).await {
            Ok(summary) => info!("Escaneo completado: {summary}"),
            Err(e) => error!("Error escaneando {}: {e}", dir.display()),
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "scanning_started", "track_id": track_id })),
    )
}

#[axum::debug_handler]
async fn docs_by_status_handler(
    State(state): State<AppState>,
    Path(status): Path<String>,
) -> Result<Json<DocsResponse>, ApiError> {
    let status: DocStatus = status.parse().map_err(api_error)?;
    let documents = state
        .engine
        .get_docs_by_status(status)
        .await
        .map_err(api_error)?;
    Ok(Json(DocsResponse { documents }))
}

#[axum::debug_handler]
async fn docs_by_track_handler(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> Result<Json<DocsResponse>, ApiError> {
    let documents = state
        .engine
        .get_docs_by_track_id(&track_id)
        .await
        .map_err(api_error)?;
    Ok(Json(DocsResponse { documents }))
}

#[axum::debug_handler]
async fn status_counts_handler(
    State(state): State<AppState>,
) -> Result<Json<HashMap<DocStatus, usize>>, ApiError> {
    state
        .engine
        .get_status_counts()
        .await
        .map(Json)
        .map_err(api_error)
}

#[axum::debug_handler]
async fn pipeline_status_handler(
    State(state): State<AppState>,
) -> Result<Json<PipelineStatus>, ApiError> {
    state.engine.pipeline_status().await.map(Json).map_err(api_error)
}

#[axum::debug_handler]
async fn query_handler(
    State(state): State<AppState>,
    Json(payload): Json<QueryPayload>,
) -> Result<Json<QueryResponse>, ApiError> {
    if payload.query.trim().is_empty() {
        return Err(api_error(RagError::Validation("query must not be empty".into())));
    }
    let response = state
        .engine
        .query(&payload.query, &payload.param)
        .await
        .map_err(api_error)?;
    Ok(Json(QueryResponse { response }))
}

#[axum::debug_handler]
async fn graph_handler(
    State(state): State<AppState>,
    Query(params): Query<GraphQuery>,
) -> Result<Json<KnowledgeGraph>, ApiError> {
    state
        .engine
        .get_knowledge_graph(&params.label, params.max_depth, params.max_nodes)
        .await
        .map(Json)
        .map_err(api_error)
}

#[axum::debug_handler]
async fn labels_handler(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    state.engine.get_all_labels().await.map(Json).map_err(api_error)
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = match state.shutdown_sender.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}
