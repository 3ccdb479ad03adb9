//! Online judge grading engine
//!
//! Pools isolate sandboxes behind nested admission limiters, compiles and
//! executes submissions inside them, compares outputs with built-in or
//! problem-supplied checkers and turns per-test results into a score.

pub mod boxmanager;
pub mod checkers;
pub mod config;
pub mod error;
pub mod grader;
pub mod languages;
pub mod logging;
pub mod redis_manager;
pub mod rpc;
pub mod sandbox;
pub mod scoring;
pub mod store;
pub mod tasks;
pub mod verdict;

pub use boxmanager::BoxManager;
pub use config::GraderConfig;
pub use error::{GraderError, Result};
pub use grader::{Grader, GraderDeps, Waker};
