//! Tasks - units of sandboxed work
//!
//! - `compile`: build a submission (or checker) into an artifact
//! - `execute`: run an artifact against one test and classify the outcome
//!
//! Both are `boxmanager::Task` implementations wrapped in helpers that take
//! care of acquiring the sandbox.

pub mod compile;
pub mod execute;

pub use compile::{compile, CompileRequest, CompileResponse, CompileTask};
pub use execute::{execute, ExecRequest, ExecResponse, ExecuteTask};
