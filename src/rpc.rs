//! Evaluator RPC - compile, execute and clean over HTTP
//!
//! Lets a web tier in another process use this grader's box manager and
//! stores directly. Every handler goes through the same `BoxManager` as the
//! in-process grader, so RPC work counts against the same sandbox ceiling.
//!
//! Problems and submissions can also be registered here; a new submission
//! wakes the grader, which picks it up on its next feeder pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::boxmanager::BoxManager;
use crate::error::{GraderError, StoreError};
use crate::grader::Waker;
use crate::languages::Languages;
use crate::store::{
    CheckerProgram, DataStore, Problem, ScoringType, SubTest, Submission, SubmissionStore,
    SubmissionSubTask,
};
use crate::tasks::{compile, execute, CompileRequest, CompileResponse, ExecRequest, ExecResponse};

#[derive(Clone)]
pub struct RpcState {
    pub boxes: BoxManager,
    pub data: Arc<dyn DataStore>,
    pub languages: Arc<Languages>,
    pub submissions: Arc<dyn SubmissionStore>,
    pub waker: Waker,
    /// Flipped once the startup privilege check passed
    pub ready: Arc<AtomicBool>,
}

#[derive(Debug, Deserialize)]
pub struct CompileBody {
    pub id: i64,
    pub language: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub submission_id: i64,
    pub subtest_id: i64,
    pub test_id: i64,
    pub input_name: String,
    pub output_name: String,
    pub time_limit_ms: u32,
    pub memory_limit_kb: u32,
    #[serde(default)]
    pub stack_limit_kb: u32,
    pub language: String,
}

#[derive(Debug, Deserialize)]
pub struct TestBody {
    pub score: i64,
    pub input: String,
    pub output: String,
}

#[derive(Debug, Deserialize)]
pub struct SubtaskBody {
    pub score: i64,
    /// 1-based positions in the problem's test list
    pub tests: Vec<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ProblemBody {
    pub name: String,
    pub time_limit_ms: u32,
    pub memory_limit_kb: u32,
    #[serde(default)]
    pub stack_limit_kb: u32,
    #[serde(default)]
    pub default_points: i64,
    #[serde(default)]
    pub scoring: ScoringType,
    #[serde(default)]
    pub io_filename: Option<String>,
    #[serde(default)]
    pub checker: Option<CheckerProgram>,
    pub tests: Vec<TestBody>,
    #[serde(default)]
    pub subtasks: Vec<SubtaskBody>,
}

#[derive(Debug, Serialize)]
pub struct ProblemCreated {
    pub problem_id: i64,
    pub test_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SubmissionBody {
    pub problem_id: i64,
    pub language: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct SubmissionView {
    #[serde(flatten)]
    pub submission: Submission,
    pub subtests: Vec<SubTest>,
    pub subtasks: Vec<SubmissionSubTask>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CleanResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ready: bool,
    pub languages: Vec<String>,
}

/// Error body returned by every handler
#[derive(Debug)]
pub struct RpcError {
    status: StatusCode,
    message: String,
}

impl From<GraderError> for RpcError {
    fn from(e: GraderError) -> Self {
        let status = match e {
            GraderError::UnknownLanguage(_) | GraderError::Store(StoreError::Invalid(_)) => {
                StatusCode::BAD_REQUEST
            }
            GraderError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            GraderError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for RpcError {
    fn from(e: StoreError) -> Self {
        GraderError::from(e).into()
    }
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/compile", post(compile_handler))
        .route("/execute", post(execute_handler))
        .route("/clean/{id}", post(clean_handler))
        .route("/problems", post(create_problem_handler))
        .route("/submissions", post(create_submission_handler))
        .route("/submissions/{id}", get(submission_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until `shutdown` becomes true
pub async fn serve(addr: &str, state: RpcState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Evaluator RPC listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

pub async fn compile_handler(
    State(state): State<RpcState>,
    Json(body): Json<CompileBody>,
) -> Result<Json<CompileResponse>, RpcError> {
    let language = state
        .languages
        .get(&body.language)
        .ok_or(GraderError::UnknownLanguage(body.language))?;
    let resp = compile(&state.boxes, CompileRequest::new(body.id, language, body.code)).await?;
    Ok(Json(resp))
}

pub async fn execute_handler(
    State(state): State<RpcState>,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<ExecResponse>, RpcError> {
    let language = state
        .languages
        .get(&body.language)
        .ok_or(GraderError::UnknownLanguage(body.language))?;
    let req = ExecRequest {
        submission_id: body.submission_id,
        subtest_id: body.subtest_id,
        test_id: body.test_id,
        input_name: body.input_name,
        output_name: body.output_name,
        time_limit_ms: body.time_limit_ms,
        memory_limit_kb: body.memory_limit_kb,
        stack_limit_kb: body.stack_limit_kb,
        language,
    };
    Ok(Json(execute(&state.boxes, state.data.as_ref(), req).await))
}

pub async fn clean_handler(State(state): State<RpcState>, Path(id): Path<i64>) -> Json<CleanResponse> {
    let success = match state.boxes.clean(id).await {
        Ok(removed) => removed,
        Err(e) => {
            warn!(id, "Clean failed: {}", e);
            false
        }
    };
    Json(CleanResponse { success })
}

pub async fn create_problem_handler(
    State(state): State<RpcState>,
    Json(body): Json<ProblemBody>,
) -> Result<(StatusCode, Json<ProblemCreated>), RpcError> {
    let mut subtasks = Vec::with_capacity(body.subtasks.len());
    for subtask in &body.subtasks {
        let positions = subtask
            .tests
            .iter()
            .map(|&n| n.checked_sub(1))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| StoreError::Invalid("tests are numbered from 1".into()))?;
        subtasks.push((subtask.score, positions));
    }
    let scores: Vec<i64> = body.tests.iter().map(|t| t.score).collect();
    let problem = Problem {
        id: 0,
        name: body.name,
        time_limit_ms: body.time_limit_ms,
        memory_limit_kb: body.memory_limit_kb,
        stack_limit_kb: body.stack_limit_kb,
        default_points: body.default_points,
        scoring: body.scoring,
        io_filename: body.io_filename,
        checker: body.checker,
    };

    let (problem, tests) = state
        .submissions
        .create_problem(problem, &scores, &subtasks)
        .await?;
    for (test, data) in tests.iter().zip(&body.tests) {
        state
            .data
            .save_test(test.id, data.input.as_bytes(), data.output.as_bytes())
            .await?;
    }
    info!(problem_id = problem.id, tests = tests.len(), "Registered problem");

    let created = ProblemCreated {
        problem_id: problem.id,
        test_ids: tests.iter().map(|t| t.id).collect(),
    };
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn create_submission_handler(
    State(state): State<RpcState>,
    Json(body): Json<SubmissionBody>,
) -> Result<(StatusCode, Json<Submission>), RpcError> {
    if state.languages.get(&body.language).is_none() {
        return Err(GraderError::UnknownLanguage(body.language).into());
    }
    let sub = state
        .submissions
        .create_submission(body.problem_id, &body.language, &body.code)
        .await?;
    state.waker.wake();
    Ok((StatusCode::CREATED, Json(sub)))
}

pub async fn submission_handler(
    State(state): State<RpcState>,
    Path(id): Path<i64>,
) -> Result<Json<SubmissionView>, RpcError> {
    let submission = state.submissions.submission(id).await?;
    let mut subtests = state.submissions.subtests(id).await?;
    subtests.sort_by_key(|st| st.id);
    let subtasks = state.submissions.submission_subtasks(id).await?;
    Ok(Json(SubmissionView {
        submission,
        subtests,
        subtasks,
    }))
}

pub async fn health_handler(State(state): State<RpcState>) -> (StatusCode, Json<HealthResponse>) {
    let ready = state.ready.load(Ordering::Acquire);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        ready,
        languages: state.languages.enabled(),
    };
    (status, Json(body))
}
