//! Execute task
//!
//! Runs a compiled artifact against one test input under the problem's
//! limits, classifies the outcome and stores the produced output for the
//! checker.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::boxmanager::{BoxManager, Task};
use crate::error::{Result, SandboxError};
use crate::languages::Language;
use crate::sandbox::{ExitKind, RunConfig, RunStats, Sandbox};
use crate::store::{ArtifactStore, DataStore, StoreResult};
use crate::verdict;

/// Wall clock ceiling when the problem has no time limit
const UNLIMITED_WALL_TIME_MS: u32 = 30_000;

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub submission_id: i64,
    pub subtest_id: i64,
    pub test_id: i64,
    /// `stdin` for console input, otherwise the file name inside the box
    pub input_name: String,
    pub output_name: String,
    pub time_limit_ms: u32,
    pub memory_limit_kb: u32,
    pub stack_limit_kb: u32,
    pub language: Arc<Language>,
}

impl ExecRequest {
    fn is_console(&self) -> bool {
        self.input_name == "stdin"
    }

    fn input_path(&self) -> String {
        format!("/box/{}", self.input_name)
    }

    fn output_path(&self) -> String {
        format!("/box/{}", self.output_name)
    }

    fn wall_time_limit_ms(&self) -> u32 {
        if self.time_limit_ms == 0 {
            UNLIMITED_WALL_TIME_MS
        } else {
            self.time_limit_ms.saturating_mul(2).saturating_add(1000)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub time_ms: u32,
    pub memory_kb: u32,
    pub exit: ExitKind,
    /// Empty when the program ran cleanly and produced output
    pub comments: String,
}

impl ExecResponse {
    pub fn internal_error(detail: impl std::fmt::Display) -> Self {
        Self {
            exit: ExitKind::SandboxError,
            comments: verdict::internal_error(detail),
            ..Default::default()
        }
    }

    /// The program exited normally and its output was stored
    pub fn is_clean(&self) -> bool {
        self.exit == ExitKind::Normal && self.comments.is_empty()
    }
}

/// Run one test. Infrastructure failures come back as an internal error
/// comment rather than an `Err`.
pub async fn execute(manager: &BoxManager, data: &dyn DataStore, req: ExecRequest) -> ExecResponse {
    let subtest_id = req.subtest_id;
    let mut task = ExecuteTask::new(req, manager.artifacts(), data);
    if let Err(e) = manager.run_task(&mut task).await {
        warn!(subtest_id, "Execution failed: {}", e);
        return ExecResponse::internal_error(e);
    }

    if let Some(output) = task.output.take() {
        if let Err(e) = data.save_subtest_output(subtest_id, &output).await {
            return ExecResponse::internal_error(e);
        }
    }
    task.response
}

/// Program and input are only loaded once a sandbox has been granted
pub struct ExecuteTask<'a> {
    req: ExecRequest,
    artifacts: &'a ArtifactStore,
    data: &'a dyn DataStore,
    pub response: ExecResponse,
    /// What the program wrote, when it exited cleanly
    pub output: Option<Vec<u8>>,
}

impl<'a> ExecuteTask<'a> {
    pub fn new(req: ExecRequest, artifacts: &'a ArtifactStore, data: &'a dyn DataStore) -> Self {
        Self {
            req,
            artifacts,
            data,
            response: ExecResponse::default(),
            output: None,
        }
    }

    async fn load(&self) -> StoreResult<(Vec<u8>, Vec<u8>)> {
        let program = self.artifacts.load(self.req.submission_id).await?;
        let input = self.data.test_input(self.req.test_id).await?;
        Ok((program, input))
    }

    fn run_config(&self) -> RunConfig {
        let lang = &self.req.language;
        let mut config = RunConfig::new()
            .with_time_limit(self.req.time_limit_ms)
            .with_wall_time_limit(self.req.wall_time_limit_ms())
            .with_memory_limit(self.req.memory_limit_kb)
            .with_stack_limit(self.req.stack_limit_kb)
            .with_max_procs(1)
            .with_env(lang.run_env());
        if self.req.is_console() {
            config = config
                .with_stdin(self.req.input_path())
                .with_stdout(self.req.output_path());
        }
        if !lang.compiled {
            // Interpreters need their runtime mounted at run time as well
            config = config.with_directories(lang.mounts.iter().cloned());
        }
        config
    }
}

#[async_trait]
impl<'a> Task for ExecuteTask<'a> {
    async fn execute(&mut self, sandbox: &dyn Sandbox) -> Result<()> {
        let (program, input) = match self.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.response = ExecResponse::internal_error(e);
                return Ok(());
            }
        };
        let lang = self.req.language.clone();
        sandbox.write_file(&lang.compiled_name, &program, 0o777).await?;
        sandbox.write_file(&self.req.input_path(), &input, 0o666).await?;
        drop(program);
        drop(input);

        let config = self.run_config();
        debug!(
            subtest_id = self.req.subtest_id,
            box_id = sandbox.id(),
            "Running {:?}",
            lang.run_command
        );
        let stats = sandbox.run_command(&lang.run_command, &config).await?;

        self.response = classify(&stats, self.req.time_limit_ms);
        if !self.response.is_clean() {
            return Ok(());
        }

        match sandbox.read_file(&self.req.output_path()).await {
            Ok(output) => self.output = Some(output),
            Err(SandboxError::MissingFile(_)) => self.response.comments = verdict::NO_OUTPUT.into(),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// Turn raw run stats into the reported outcome. Time above the limit is
/// reported as exactly the limit.
fn classify(stats: &RunStats, time_limit_ms: u32) -> ExecResponse {
    let mut resp = ExecResponse {
        time_ms: stats.time_ms,
        memory_kb: stats.memory_kb,
        exit: stats.exit,
        comments: String::new(),
    };

    let over_time = time_limit_ms > 0 && stats.time_ms > time_limit_ms;
    if over_time {
        resp.time_ms = time_limit_ms;
    }

    if stats.memory_limit_exceeded {
        resp.comments = verdict::MEMORY_LIMIT.into();
        return resp;
    }

    match stats.exit {
        ExitKind::TimeLimit => {
            resp.comments = if stats.message.contains("wall") {
                verdict::WALL_TIMEOUT.into()
            } else {
                verdict::TIMEOUT.into()
            };
        }
        ExitKind::RuntimeError | ExitKind::Signaled if !stats.message.is_empty() => {
            resp.comments = stats.message.clone();
        }
        ExitKind::RuntimeError => {
            resp.comments = format!("Exited with error status {}", stats.exit_code);
        }
        ExitKind::Signaled => {
            resp.comments = match stats.exit_signal {
                Some(signal) => format!("Caught fatal signal {}", signal),
                None => "Caught fatal signal".to_string(),
            };
        }
        ExitKind::SandboxError => resp.comments = verdict::sandbox_error(&stats.message),
        ExitKind::Normal if over_time => {
            resp.exit = ExitKind::TimeLimit;
            resp.comments = verdict::TIMEOUT.into();
        }
        ExitKind::Normal => {}
    }
    resp
}
