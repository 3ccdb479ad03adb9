//! Error types shared across the grading engine
//!
//! Component seams return typed errors so callers can tell an
//! unjudgeable environment (isolate missing, no privileges) apart from a
//! single failed SubTest. The binary converts everything into `anyhow`.

use thiserror::Error;

/// Errors raised by a sandbox implementation
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The isolation tool could not create the box
    #[error("failed to initialize box {box_id}: {message}")]
    Init { box_id: u32, message: String },

    /// The isolation tool refused to run for lack of privileges
    #[error("isolate lacks required privileges: {0}")]
    Permission(String),

    /// The isolation tool could not be spawned or exited abnormally
    #[error("isolate invocation failed: {0}")]
    Tool(String),

    /// A file requested from the box does not exist
    #[error("file {0} does not exist in the sandbox")]
    MissingFile(String),

    #[error("sandbox io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the persistence collaborators
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store backend error: {0}")]
    Backend(String),

    /// The caller asked for something the store cannot represent
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: i64) -> Self {
        StoreError::NotFound { kind, id }
    }
}

/// Umbrella error for tasks, checkers and the grader
#[derive(Debug, Error)]
pub enum GraderError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown or disabled language: {0}")]
    UnknownLanguage(String),

    /// The box manager was closed while a task was waiting for a slot
    #[error("box manager is closed")]
    Closed,

    #[error("checker error: {0}")]
    Checker(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = GraderError> = std::result::Result<T, E>;
