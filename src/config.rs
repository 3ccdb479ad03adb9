//! Grader configuration
//!
//! Loaded once from the environment (after `.env` has been applied) and then
//! passed by value into the constructors that need it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Which backend holds test data and SubTest outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBackend {
    Fs,
    S3,
}

/// Grader configuration
#[derive(Debug, Clone)]
pub struct GraderConfig {
    /// Number of sandboxes that may run at once, system-wide
    pub concurrency: u32,
    /// First isolate box id owned by this grader
    pub box_id_base: u32,
    /// Path to the isolate binary
    pub isolate_path: String,
    /// Per-box memory quota in KB (0 = unlimited)
    pub memory_quota_kb: u32,
    /// Root of the compile-artifact store
    pub compile_dir: PathBuf,
    /// Root of the filesystem data store
    pub data_dir: PathBuf,
    pub data_backend: DataBackend,
    /// Directory that receives grader.log
    pub log_dir: PathBuf,
    /// Maximum number of waiting submissions fetched per cycle
    pub waiting_batch: usize,
    /// Maximum number of re-evaluating submissions fetched per cycle
    pub reeval_batch: usize,
    /// Feeder timer period
    pub tick: Duration,
    /// Evaluator RPC listen address (None disables the server)
    pub rpc_addr: Option<String>,
    pub redis_url: Option<String>,
    /// Optional language file overriding the embedded one
    pub languages_path: Option<PathBuf>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(2);
        Self {
            concurrency,
            box_id_base: 0,
            isolate_path: "isolate".to_string(),
            memory_quota_kb: 0,
            compile_dir: PathBuf::from("/tmp/grading/compiles"),
            data_dir: PathBuf::from("/tmp/grading/data"),
            data_backend: DataBackend::Fs,
            log_dir: PathBuf::from("./logs"),
            waiting_batch: 40,
            reeval_batch: 5,
            tick: Duration::from_secs(5),
            rpc_addr: Some("127.0.0.1:8090".to_string()),
            redis_url: None,
            languages_path: None,
        }
    }
}

impl GraderConfig {
    /// Build the configuration from environment variables, falling back to
    /// defaults for anything unset
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(n) = parse_var::<u32>("GRADER_CONCURRENCY")? {
            if n == 0 {
                anyhow::bail!("GRADER_CONCURRENCY must be at least 1");
            }
            config.concurrency = n;
        }
        if let Some(base) = parse_var("GRADER_BOX_ID_BASE")? {
            config.box_id_base = base;
        }
        if let Ok(path) = std::env::var("ISOLATE_PATH") {
            config.isolate_path = path;
        }
        if let Some(quota) = parse_var("GRADER_MEMORY_QUOTA_KB")? {
            config.memory_quota_kb = quota;
        }
        if let Ok(dir) = std::env::var("GRADER_COMPILE_DIR") {
            config.compile_dir = dir.into();
        }
        if let Ok(dir) = std::env::var("GRADER_DATA_DIR") {
            config.data_dir = dir.into();
        }
        if let Ok(backend) = std::env::var("GRADER_DATA_BACKEND") {
            config.data_backend = match backend.to_lowercase().as_str() {
                "fs" => DataBackend::Fs,
                "s3" | "minio" => DataBackend::S3,
                other => anyhow::bail!("Unknown GRADER_DATA_BACKEND: {}", other),
            };
        }
        if let Ok(dir) = std::env::var("GRADER_LOG_DIR") {
            config.log_dir = dir.into();
        }
        if let Some(batch) = parse_var("GRADER_WAITING_BATCH")? {
            config.waiting_batch = batch;
        }
        if let Some(batch) = parse_var("GRADER_REEVAL_BATCH")? {
            config.reeval_batch = batch;
        }
        if let Some(secs) = parse_var::<u64>("GRADER_TICK_SECS")? {
            config.tick = Duration::from_secs(secs.max(1));
        }
        if let Ok(addr) = std::env::var("GRADER_RPC_ADDR") {
            config.rpc_addr = (!addr.trim().is_empty()).then_some(addr);
        }
        config.redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        config.languages_path = std::env::var("GRADER_LANGUAGES").ok().map(PathBuf::from);

        Ok(config)
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {}", name, value))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}
