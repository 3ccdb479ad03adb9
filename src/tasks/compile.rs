//! Compile task
//!
//! Writes the sources (and any header scaffolding) into the box, runs the
//! language's compile command and saves the artifact under the request id.
//! A failed compilation is a normal response with `success == false`; only
//! infrastructure problems are errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::boxmanager::{BoxManager, Task};
use crate::error::{Result, SandboxError};
use crate::languages::Language;
use crate::sandbox::{RunConfig, RunStats, Sandbox};
use crate::store::ArtifactStore;

const COMPILE_OUTPUT_PATH: &str = "/box/compilation.out";
/// Characters of compiler output kept for display
const COMPILE_OUTPUT_LIMIT: usize = 4500;
const TRIMMED_MARKER: &str = "... (compilation output trimmed)";

pub const COMPILE_WALL_TIME_MS: u32 = 30_000;
pub const COMPILE_MEMORY_LIMIT_KB: u32 = 2 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Artifact key; negative ids are checkers
    pub id: i64,
    pub language: Arc<Language>,
    /// Box path -> contents; these are passed to the compiler
    pub code_files: BTreeMap<String, Vec<u8>>,
    /// Box path -> contents; written but not passed to the compiler
    pub header_files: BTreeMap<String, Vec<u8>>,
    pub memory_limit_kb: u32,
}

impl CompileRequest {
    /// Single-file request using the language's source name
    pub fn new(id: i64, language: Arc<Language>, code: impl Into<Vec<u8>>) -> Self {
        let code_files = BTreeMap::from([(language.source_name.clone(), code.into())]);
        Self {
            id,
            language,
            code_files,
            header_files: BTreeMap::new(),
            memory_limit_kb: COMPILE_MEMORY_LIMIT_KB,
        }
    }

    pub fn with_header(mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.header_files.insert(path.into(), data.into());
        self
    }

    pub fn with_memory_limit(mut self, kb: u32) -> Self {
        self.memory_limit_kb = kb;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompileResponse {
    /// Compiler output shown to the user
    pub output: String,
    pub success: bool,
    /// Internal diagnostic, not shown to contestants
    pub other: String,
    #[serde(skip)]
    pub stats: Option<RunStats>,
}

/// Compile `req`, using a sandbox only when the language is compiled
pub async fn compile(manager: &BoxManager, req: CompileRequest) -> Result<CompileResponse> {
    if !req.language.compiled {
        return save_source(manager.artifacts(), &req).await;
    }
    let mut task = CompileTask::new(req, manager.artifacts().clone());
    manager.run_task(&mut task).await?;
    Ok(task.response)
}

/// Interpreted languages run their source directly
async fn save_source(artifacts: &ArtifactStore, req: &CompileRequest) -> Result<CompileResponse> {
    if req.code_files.len() > 1 {
        warn!(id = req.id, "More than one file for an interpreted language, keeping the first");
    }
    let mut response = CompileResponse {
        success: true,
        ..Default::default()
    };
    if let Some(code) = req.code_files.values().next() {
        if let Err(e) = artifacts.save(req.id, code).await {
            response.success = false;
            response.other = e.to_string();
        }
    }
    Ok(response)
}

pub struct CompileTask {
    req: CompileRequest,
    artifacts: ArtifactStore,
    pub response: CompileResponse,
}

impl CompileTask {
    pub fn new(req: CompileRequest, artifacts: ArtifactStore) -> Self {
        Self {
            req,
            artifacts,
            response: CompileResponse::default(),
        }
    }
}

#[async_trait]
impl Task for CompileTask {
    async fn execute(&mut self, sandbox: &dyn Sandbox) -> Result<()> {
        let lang = &self.req.language;
        info!(id = self.req.id, box_id = sandbox.id(), language = %lang.name, "Compiling");

        for (path, data) in self.req.code_files.iter().chain(&self.req.header_files) {
            sandbox.write_file(path, data, 0o644).await?;
        }

        let sources: Vec<String> = self.req.code_files.keys().cloned().collect();
        let command = lang.compile_argv(&sources);
        debug!(id = self.req.id, "Compile command: {:?}", command);

        let config = RunConfig::new()
            .with_stdout(COMPILE_OUTPUT_PATH)
            .with_stderr_to_stdout(true)
            .with_wall_time_limit(COMPILE_WALL_TIME_MS)
            .with_memory_limit(self.req.memory_limit_kb)
            .with_inherit_env(true)
            .with_env(lang.build_env())
            .with_directories(lang.mounts.iter().cloned());

        let stats = sandbox.run_command(&command, &config).await?;

        let output = match sandbox.read_file(COMPILE_OUTPUT_PATH).await {
            Ok(data) => String::from_utf8_lossy(&data).into_owned(),
            Err(SandboxError::MissingFile(_)) => String::new(),
            Err(e) => {
                warn!(id = self.req.id, "Couldn't read compilation output: {}", e);
                String::new()
            }
        };
        self.response.output = truncate_output(&output);

        let produced = sandbox.file_exists(&lang.compiled_name).await;
        self.response.success = stats.is_success() && produced;
        if !self.response.success {
            if stats.is_success() {
                self.response.other = format!("compiler exited cleanly but {} is missing", lang.compiled_name);
            } else if !stats.message.is_empty() {
                self.response.other = stats.message.clone();
            }
            self.response.stats = Some(stats);
            return Ok(());
        }
        self.response.stats = Some(stats);

        match sandbox.read_file(&lang.compiled_name).await {
            Ok(artifact) => {
                if let Err(e) = self.artifacts.save(self.req.id, &artifact).await {
                    self.response.success = false;
                    self.response.other = e.to_string();
                }
            }
            Err(e) => {
                self.response.success = false;
                self.response.other = e.to_string();
            }
        }
        Ok(())
    }
}

/// Keep the first `COMPILE_OUTPUT_LIMIT` characters of compiler output
fn truncate_output(output: &str) -> String {
    match output.char_indices().nth(COMPILE_OUTPUT_LIMIT) {
        Some((cut, _)) => format!("{}{}", &output[..cut], TRIMMED_MARKER),
        None => output.to_string(),
    }
}
