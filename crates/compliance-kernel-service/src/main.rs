use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use compliance_kernel_api::{
    AskResponse, ComplianceKernelApi, ImportResult, KernelConfig, MigrateResult, RolloutAssignment,
    API_CONTRACT_VERSION,
};
use compliance_kernel_core::{CorpusBundle, MetricsSnapshot, Query, ReasoningEvent};
use compliance_kernel_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ComplianceKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct EventsResponse {
    request_id: String,
    events: Vec<ReasoningEvent>,
}

#[derive(Debug, Parser)]
#[command(name = "compliance-kernel-service")]
#[command(about = "Local HTTP service for Compliance Kernel")]
struct Args {
    #[arg(long, default_value = "./compliance_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Optional YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/corpus/import", post(corpus_import))
        .route("/v1/query/ask", post(query_ask))
        .route("/v1/query/events/:request_id", get(query_events))
        .route("/v1/rollout/:key", get(rollout))
        .route("/v1/metrics", get(metrics))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = KernelConfig::load(args.config.as_deref())?;
    let state = ServiceState { api: ComplianceKernelApi::with_config(args.db, config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "compliance kernel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

/// SQLite access and outbound model calls block; keep them off the async workers.
async fn run_blocking<T, F>(work: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ServiceState::error(format!("blocking task failed: {err}")))?
        .map_err(|err| ServiceState::error(format!("{err:#}")))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let api = state.api.clone();
    let status = run_blocking(move || api.schema_status()).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let api = state.api.clone();
    let result = run_blocking(move || api.migrate(request.dry_run)).await?;
    Ok(Json(envelope(result)))
}

async fn corpus_import(
    State(state): State<ServiceState>,
    Json(bundle): Json<CorpusBundle>,
) -> Result<Json<ServiceEnvelope<ImportResult>>, ServiceError> {
    let api = state.api.clone();
    let result = run_blocking(move || api.import_corpus(&bundle)).await?;
    Ok(Json(envelope(result)))
}

async fn query_ask(
    State(state): State<ServiceState>,
    Json(query): Json<Query>,
) -> Result<Json<ServiceEnvelope<AskResponse>>, ServiceError> {
    let api = state.api.clone();
    let response = run_blocking(move || api.ask(query)).await?;
    Ok(Json(envelope(response)))
}

async fn query_events(
    State(state): State<ServiceState>,
    Path(request_id): Path<String>,
) -> Result<Json<ServiceEnvelope<EventsResponse>>, ServiceError> {
    let api = state.api.clone();
    let lookup = request_id.clone();
    let events = run_blocking(move || api.events(&lookup)).await?;
    Ok(Json(envelope(EventsResponse { request_id, events })))
}

async fn rollout(
    State(state): State<ServiceState>,
    Path(key): Path<String>,
) -> Json<ServiceEnvelope<RolloutAssignment>> {
    Json(envelope(state.api.rollout(&key)))
}

async fn metrics(State(state): State<ServiceState>) -> Json<ServiceEnvelope<MetricsSnapshot>> {
    Json(envelope(state.api.metrics()))
}
