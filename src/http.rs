//! Minimal HTTP driving surface (spec §6, SPEC_FULL.md §3): submit, list,
//! reposition, cancel, health. Everything beyond this is explicitly out of
//! scope (spec §1 "Explicitly out of scope").

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use oms_core::catalog::{ResourceTotals, RunCatalog, RunStateView};
use oms_core::error::SchedError;
use oms_core::job::RunJob;
use oms_core::paths::{QueueName, QUEUE_DIR};
use oms_core::stamp::Stamp;

pub struct AppStateInner {
    pub job_control_root: std::path::PathBuf,
    pub self_instance: String,
    pub catalog: Arc<RunCatalog>,
}

#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub enum AppError {
    Sched(SchedError),
    DiskOverLimit,
    NotFound,
    BadRequest(String),
}

impl From<SchedError> for AppError {
    fn from(e: SchedError) -> Self {
        AppError::Sched(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Sched(e) => {
                warn!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::DiskOverLimit => (
                StatusCode::INSUFFICIENT_STORAGE,
                "instance disk quota exceeded".to_string(),
            ),
            AppError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

/// Job submission request body — the fields the HTTP layer contributes on
/// top of a [`RunJob`] (spec §3 "RunJob"; `cpu`/`mem` are re-derived from the
/// other fields rather than trusted from the client).
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub model_name: String,
    pub model_digest: String,
    pub run_name: String,
    pub working_dir: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub table_retention: Vec<String>,
    #[serde(default)]
    pub run_notes: HashMap<String, String>,
    #[serde(default)]
    pub microdata: Vec<String>,
    pub template_name: Option<String>,
    #[serde(default)]
    pub is_mpi: bool,
    #[serde(default = "default_one")]
    pub process_count: u32,
    #[serde(default = "default_one")]
    pub threads_per_process: u32,
    #[serde(default)]
    pub mem_per_process: u64,
    #[serde(default)]
    pub mem_per_thread: u64,
    #[serde(default)]
    pub not_on_mpi_root: bool,
    #[serde(default)]
    pub no_job_control_hostfile: bool,
    pub position: Option<u32>,
}

fn default_one() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub sub_stamp: Stamp,
    pub queue_file: String,
}

async fn submit(State(state): State<AppState>, Json(req): Json<SubmitRequest>) -> Result<impl IntoResponse, AppError> {
    if let Some(disk) = state.inner.catalog.disk_use().await {
        if disk.is_over {
            return Err(AppError::DiskOverLimit);
        }
    }

    let sub_stamp = Stamp::now();
    let job = RunJob {
        sub_stamp: sub_stamp.clone(),
        run_stamp: None,
        instance: state.inner.self_instance.clone(),
        model_name: req.model_name,
        model_digest: req.model_digest,
        run_name: req.run_name,
        working_dir: req.working_dir,
        options: req.options,
        env: req.env,
        table_retention: req.table_retention,
        run_notes: req.run_notes,
        microdata: req.microdata,
        template_name: req.template_name,
        is_mpi: req.is_mpi,
        process_count: req.process_count,
        threads_per_process: req.threads_per_process,
        mem_per_process: req.mem_per_process,
        mem_per_thread: req.mem_per_thread,
        not_on_mpi_root: req.not_on_mpi_root,
        no_job_control_hostfile: req.no_job_control_hostfile,
        position: req.position.unwrap_or_else(RunJob::default_position),
        pid: None,
        command_path: None,
        log_file_name: None,
    };
    let demand = job.demand();

    let queue_name = QueueName {
        sub_stamp: sub_stamp.clone(),
        instance: job.instance.clone(),
        model: job.model_name.clone(),
        digest: job.model_digest.clone(),
        run_stamp: None,
        cpu: demand.cpu,
        mem: demand.mem,
        position: job.position,
    };
    let path = state.inner.job_control_root.join(QUEUE_DIR).join(queue_name.encode());
    let body = serde_json::to_vec_pretty(&job).map_err(|e| AppError::BadRequest(e.to_string()))?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| SchedError::io(path.display().to_string(), e))?;

    info!(sub_stamp = %sub_stamp, model = %job.model_name, "job submitted");
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            sub_stamp,
            queue_file: path.display().to_string(),
        }),
    ))
}

async fn list_model(State(state): State<AppState>, Path(model): Path<String>) -> Json<Vec<RunStateView>> {
    Json(state.inner.catalog.snapshot_model(&model).await)
}

async fn list_all(State(state): State<AppState>) -> Json<Vec<RunStateView>> {
    Json(state.inner.catalog.snapshot_all().await)
}

async fn cancel(State(state): State<AppState>, Path((model, run_stamp)): Path<(String, String)>) -> Result<StatusCode, AppError> {
    let stamp = Stamp::parse(&run_stamp).map_err(|e| AppError::BadRequest(e.to_string()))?;
    match state.inner.catalog.take_kill(&model, &stamp).await {
        Some(tx) => {
            let _ = tx.send(());
            Ok(StatusCode::ACCEPTED)
        }
        None => Err(AppError::NotFound),
    }
}

#[derive(Debug, Deserialize)]
pub struct RepositionRequest {
    pub position: u32,
}

async fn reposition(
    State(state): State<AppState>,
    Path(sub_stamp): Path<String>,
    Json(req): Json<RepositionRequest>,
) -> Result<StatusCode, AppError> {
    let target = Stamp::parse(&sub_stamp).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let queue_dir = state.inner.job_control_root.join(QUEUE_DIR);
    let mut read_dir = tokio::fs::read_dir(&queue_dir)
        .await
        .map_err(|e| SchedError::io(queue_dir.display().to_string(), e))?;

    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| SchedError::io(queue_dir.display().to_string(), e))?
    {
        let file_name = entry.file_name();
        let Some(name_str) = file_name.to_str() else { continue };
        let Ok(mut name) = QueueName::decode(name_str) else { continue };
        if name.sub_stamp != target {
            continue;
        }
        if name.position == req.position {
            return Ok(StatusCode::NO_CONTENT);
        }
        let old_path = queue_dir.join(name_str);
        name.position = req.position;
        let new_path = queue_dir.join(name.encode());
        tokio::fs::rename(&old_path, &new_path)
            .await
            .map_err(|e| SchedError::io(new_path.display().to_string(), e))?;
        return Ok(StatusCode::NO_CONTENT);
    }
    Err(AppError::NotFound)
}

#[derive(Debug, Serialize)]
struct HealthBody {
    instance: String,
    totals: ResourceTotals,
    disk_use: Option<oms_core::catalog::DiskUseSnapshot>,
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        instance: state.inner.self_instance.clone(),
        totals: state.inner.catalog.totals().await,
        disk_use: state.inner.catalog.disk_use().await,
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(submit).get(list_all))
        .route("/runs/:model", get(list_model))
        .route("/runs/:model/:run_stamp/cancel", post(cancel))
        .route("/queue/:sub_stamp/reposition", post(reposition))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
