//! Sandbox module - isolated execution slots
//!
//! This module provides the `Sandbox` contract every task runs against:
//! - File I/O inside the box (`write_file`, `read_file`, `file_exists`)
//! - Command execution under a `RunConfig`, returning `RunStats`
//! - Teardown (`close`)
//!
//! `IsolateBox` implements the contract by shelling out to isolate and
//! parsing its meta file. Nothing above this module knows about isolate
//! flags or meta keys.
//!
//! The sandbox module does NOT:
//! - Interpret verdicts or compare outputs
//! - Know about languages, submissions or tests
//! - Pool boxes (see `boxmanager`)

pub mod config;
pub mod isolate_box;
pub mod meta;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

pub use config::{Directory, RunConfig};
pub use isolate_box::{ensure_isolate_available, isolate_version, IsolateBox, IsolateFactory};

/// Exit classification of one sandboxed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    /// The program exited on its own
    #[default]
    Normal,
    /// CPU or wall time limit exceeded
    TimeLimit,
    /// Non-zero exit code
    RuntimeError,
    /// Killed by a signal
    Signaled,
    /// The isolation tool itself failed
    SandboxError,
}

/// Resource usage and exit classification from one sandboxed run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// CPU time used in milliseconds
    pub time_ms: u32,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u32,
    /// Memory used in KB
    pub memory_kb: u32,
    pub exit_code: i32,
    pub exit_signal: Option<i32>,
    pub killed: bool,
    /// Human-readable status message from the isolation tool
    pub message: String,
    pub exit: ExitKind,
    /// Set when the memory controller killed the program
    pub memory_limit_exceeded: bool,
    /// Raw diagnostic output of the isolation tool
    #[serde(skip)]
    pub internal_message: String,
}

impl RunStats {
    /// Normal exit with code 0
    pub fn is_success(&self) -> bool {
        self.exit == ExitKind::Normal && self.exit_code == 0 && !self.memory_limit_exceeded
    }
}

/// One isolated execution slot
///
/// Paths are absolute paths as seen from inside the box (`/box/main.cpp`).
/// Implementations serialize all operations on a single instance.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Numeric box id
    fn id(&self) -> u32;

    async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<(), SandboxError>;

    /// Returns `SandboxError::MissingFile` when the file does not exist
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    async fn file_exists(&self, path: &str) -> bool;

    /// Run `command` inside the box
    ///
    /// Dropping the returned future kills the running program.
    async fn run_command(
        &self,
        command: &[String],
        config: &RunConfig,
    ) -> Result<RunStats, SandboxError>;

    /// Tear down the isolation state
    async fn close(&self) -> Result<(), SandboxError>;
}

/// Creates sandboxes bound to a given box id
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, box_id: u32) -> Result<Box<dyn Sandbox>, SandboxError>;
}
