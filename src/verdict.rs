//! Verdict and comment texts stored on SubTests
//!
//! `translate:` prefixed values are translation keys resolved by the UI;
//! everything else is shown verbatim.

use std::fmt::Display;

pub const SUCCESS: &str = "translate:success";
pub const WRONG: &str = "translate:wrong";
pub const INTERNAL_ERROR: &str = "translate:internal_error";
pub const TIMEOUT: &str = "translate:timeout";
pub const WALL_TIMEOUT: &str = "translate:walltimeout";
pub const MEMORY_LIMIT: &str = "translate:memory_limit";
pub const NO_OUTPUT: &str = "No output file found";

pub const WRONG_CHECKER_OUTPUT: &str = "Wrong checker output";
pub const INVALID_CHECKER_SCORE: &str = "Invalid checker score";
pub const NO_CHECKER_MESSAGE: &str = "No checker message";

/// Internal error comment carrying a short diagnostic
pub fn internal_error(detail: impl Display) -> String {
    format!("{}({})", INTERNAL_ERROR, detail)
}

pub fn sandbox_error(message: impl Display) -> String {
    format!("Sandbox Error: {}", message)
}

/// Whether a comment was produced by an infrastructure failure
pub fn is_internal_error(comment: &str) -> bool {
    comment.starts_with(INTERNAL_ERROR)
}
