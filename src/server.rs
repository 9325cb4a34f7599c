use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Result;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::engine::{Engine, ExecutionObserver, RunInput};
use crate::schema::{GlobalSettings, HttpRequest, VariableExtraction, Workflow, WorkflowStep, WorkflowVariable};
use crate::store::{ExecutionRecord, WorkflowStore};
use crate::template::TemplateEngine;
use crate::variables::Variables;

#[derive(Clone)]
pub struct AppState {
    pub store: WorkflowStore,
    pub engine: Engine,
    pub env_vars: Variables,
    pub settings: GlobalSettings,
    running: Arc<DashMap<String, CancellationToken>>,
}

impl AppState {
    pub fn new(store: WorkflowStore, engine: Engine, env_vars: Variables, settings: GlobalSettings) -> Self {
        Self {
            store,
            engine,
            env_vars,
            settings,
            running: Arc::new(DashMap::new()),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateWorkflowRequest {
    #[serde(default)]
    pub collection_id: String,
    pub name: String,
}

#[derive(Deserialize)]
pub struct RenameWorkflowRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct AddStepRequest {
    pub request_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub extract: Vec<VariableExtraction>,
}

/// Fields left out keep their current value.
#[derive(Deserialize)]
pub struct UpdateStepRequest {
    pub request_id: Option<String>,
    pub name: Option<String>,
    pub extract: Option<Vec<VariableExtraction>>,
}

#[derive(Deserialize)]
pub struct MoveStepRequest {
    pub to: usize,
}

#[derive(Deserialize)]
pub struct SetVariablesRequest {
    pub variables: Vec<WorkflowVariable>,
}

#[derive(Deserialize, Default)]
pub struct ExecuteRequest {
    /// Layered over the server's environment for this run only.
    #[serde(default)]
    pub env_vars: Variables,
}

#[derive(Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    pub workflow_id: String,
}

#[derive(Serialize, Deserialize)]
pub struct StopResponse {
    pub execution_id: String,
    pub stopping: bool,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (status, Json(ErrorResponse { error: error.to_string() }))
}

fn not_found(error: anyhow::Error) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("{:#}", error))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/workflows", get(handle_list).post(handle_create))
        .route(
            "/workflows/{id}",
            get(handle_get).patch(handle_rename).delete(handle_delete),
        )
        .route("/workflows/{id}/steps", post(handle_add_step))
        .route(
            "/workflows/{id}/steps/{step_id}",
            put(handle_update_step).delete(handle_remove_step),
        )
        .route("/workflows/{id}/steps/{step_id}/move", post(handle_move_step))
        .route("/workflows/{id}/variables", put(handle_set_variables))
        .route("/requests", get(handle_list_requests))
        .route("/workflows/{id}/execute", post(handle_execute))
        .route("/executions/{id}", get(handle_execution))
        .route("/executions/{id}/stop", post(handle_stop))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    log::info!("🚀 Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn handle_list(State(state): State<AppState>) -> Json<Vec<Workflow>> {
    Json(state.store.list_workflows(None))
}

async fn handle_create(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkflowRequest>,
) -> (StatusCode, Json<Workflow>) {
    let workflow = state.store.create_workflow(&req.collection_id, &req.name);
    (StatusCode::CREATED, Json(workflow))
}

async fn handle_get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Workflow> {
    state
        .store
        .get_workflow(&id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Workflow '{}' not found", id)))
}

async fn handle_rename(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameWorkflowRequest>,
) -> ApiResult<Workflow> {
    state.store.rename_workflow(&id, &req.name).map(Json).map_err(not_found)
}

async fn handle_delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Workflow> {
    state.store.delete_workflow(&id).map(Json).map_err(not_found)
}

async fn handle_add_step(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AddStepRequest>,
) -> ApiResult<WorkflowStep> {
    state
        .store
        .add_step(&id, &req.request_id, &req.name, req.extract)
        .map(Json)
        .map_err(not_found)
}

async fn handle_update_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    Json(req): Json<UpdateStepRequest>,
) -> ApiResult<Workflow> {
    let mut step = state
        .store
        .get_workflow(&id)
        .and_then(|w| w.steps.into_iter().find(|s| s.id == step_id))
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                format!("Step '{}' not found in workflow '{}'", step_id, id),
            )
        })?;

    if let Some(request_id) = req.request_id {
        step.request_id = request_id;
    }
    if let Some(name) = req.name {
        step.name = name;
    }
    if let Some(extract) = req.extract {
        step.extract = extract;
    }

    state.store.update_step(&id, step).map(Json).map_err(not_found)
}

async fn handle_remove_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
) -> ApiResult<Workflow> {
    state.store.remove_step(&id, &step_id).map(Json).map_err(not_found)
}

async fn handle_move_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    Json(req): Json<MoveStepRequest>,
) -> ApiResult<Workflow> {
    if state.store.get_workflow(&id).is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("Workflow '{}' not found", id)));
    }
    state
        .store
        .move_step(&id, &step_id, req.to)
        .map(Json)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("{:#}", e)))
}

async fn handle_set_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetVariablesRequest>,
) -> ApiResult<Workflow> {
    state.store.set_variables(&id, req.variables).map(Json).map_err(not_found)
}

async fn handle_list_requests(State(state): State<AppState>) -> Json<Vec<HttpRequest>> {
    Json(state.store.list_requests())
}

/// Mirrors a run's trace lines into the execution record while it runs.
struct HistoryObserver {
    store: WorkflowStore,
    execution_id: String,
}

impl ExecutionObserver for HistoryObserver {
    fn on_log(&self, line: &str) {
        self.store.append_log(&self.execution_id, line);
    }
}

async fn handle_execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Option<Json<ExecuteRequest>>,
) -> ApiResult<ExecuteResponse> {
    let req = req.map(|Json(req)| req).unwrap_or_default();

    // Snapshot: edits made while the run is in flight do not affect it.
    let workflow = state
        .store
        .get_workflow(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Workflow '{}' not found", id)))?;

    let execution_id = state.store.begin_execution(&workflow.id);
    let token = CancellationToken::new();
    state.running.insert(execution_id.clone(), token.clone());

    let mut env_vars = state.env_vars.clone();
    env_vars.extend(req.env_vars);

    log::info!("📥 Executing workflow {} as {}", workflow.name, execution_id);

    let response = ExecuteResponse {
        execution_id: execution_id.clone(),
        workflow_id: workflow.id.clone(),
    };

    tokio::spawn(async move {
        let observer = HistoryObserver {
            store: state.store.clone(),
            execution_id: execution_id.clone(),
        };
        let input = RunInput::new(&workflow, &state.store, &TemplateEngine)
            .env_vars(env_vars)
            .settings(state.settings.clone())
            .observer(&observer)
            .cancel(token);

        let result = state.engine.execute(input).await;
        log::info!("Execution {} finished: {:?}", execution_id, result.status);

        state.running.remove(&execution_id);
        state.store.finish_execution(&execution_id, result);
    });

    Ok(Json(response))
}

async fn handle_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ExecutionRecord> {
    state
        .store
        .get_execution(&id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Execution '{}' not found", id)))
}

async fn handle_stop(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StopResponse> {
    if let Some(token) = state.running.get(&id) {
        log::info!("Stop requested for execution {}", id);
        token.cancel();
        return Ok(Json(StopResponse {
            execution_id: id,
            stopping: true,
        }));
    }

    match state.store.get_execution(&id) {
        Some(_) => Err(api_error(StatusCode::CONFLICT, format!("Execution '{}' is not running", id))),
        None => Err(api_error(StatusCode::NOT_FOUND, format!("Execution '{}' not found", id))),
    }
}
