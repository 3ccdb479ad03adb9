//! Logging setup for the binary
//!
//! Two layers: the console, filtered by `RUST_LOG` on top of `grading=info`,
//! and `grader.log`, which takes the verbose grader, box manager and sandbox
//! records (retries, raw meta files, per-test verdicts).

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const GRADER_LOG_DIRECTIVES: &str =
    "grading::grader=debug,grading::boxmanager=debug,grading::sandbox=debug,grading::checkers=debug";

/// Keeps the grader.log writer alive; drop it last
pub struct LogGuard {
    _grader_log: WorkerGuard,
}

/// Install the global subscriber
pub fn init(log_dir: &Path) -> Result<LogGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let appender = tracing_appender::rolling::never(log_dir, "grader.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console = fmt::layer()
        .with_filter(EnvFilter::from_default_env().add_directive("grading=info".parse()?));
    let grader_log = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(EnvFilter::new(GRADER_LOG_DIRECTIVES));

    tracing_subscriber::registry()
        .with(console)
        .with(grader_log)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _grader_log: guard })
}
