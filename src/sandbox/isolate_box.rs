//! Isolate box management
//!
//! Wrapper around the isolate sandbox. Each `IsolateBox` owns one box id and
//! the box directory created by `isolate --init`; every operation on an
//! instance is serialized by its lock.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::meta::parse_meta;
use super::{ExitKind, RunConfig, RunStats, Sandbox, SandboxFactory};
use crate::error::SandboxError;

const RUN_RETRIES: u32 = 3;
const RUN_RETRY_DELAY: Duration = Duration::from_millis(200);
const INIT_ATTEMPTS: u32 = 3;

/// Check that isolate is installed and usable with cgroups by this process.
///
/// A probe box is initialized and torn down again. Failure here means the
/// grader must not start.
pub async fn ensure_isolate_available(isolate_path: &str, probe_box_id: u32) -> anyhow::Result<()> {
    let version = Command::new(isolate_path)
        .arg("--version")
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("Could not run {}: {}", isolate_path, e))?;
    if !version.status.success() {
        anyhow::bail!("{} --version exited with {}", isolate_path, version.status);
    }

    if !nix::unistd::geteuid().is_root() {
        debug!("Grader is not running as root, relying on a setuid isolate binary");
    }

    let probe = IsolateBox::new(isolate_path, probe_box_id, 0).await?;
    probe.close().await?;
    Ok(())
}

/// First line of `isolate --version`, for startup logs
pub async fn isolate_version(isolate_path: &str) -> String {
    match Command::new(isolate_path).arg("--version").output().await {
        Ok(out) => {
            let text = String::from_utf8_lossy(&out.stdout);
            let line = text.lines().next().unwrap_or_default();
            line.trim_start_matches("The process isolator ").to_string()
        }
        Err(_) => "unknown".to_string(),
    }
}

/// Factory creating isolate boxes
#[derive(Debug, Clone)]
pub struct IsolateFactory {
    isolate_path: String,
    memory_quota_kb: u32,
}

impl IsolateFactory {
    pub fn new(isolate_path: impl Into<String>, memory_quota_kb: u32) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            memory_quota_kb,
        }
    }
}

#[async_trait]
impl SandboxFactory for IsolateFactory {
    async fn create(&self, box_id: u32) -> Result<Box<dyn Sandbox>, SandboxError> {
        let sandbox = IsolateBox::new(&self.isolate_path, box_id, self.memory_quota_kb).await?;
        Ok(Box::new(sandbox))
    }
}

/// One isolate box
pub struct IsolateBox {
    box_id: u32,
    /// Directory returned by `isolate --init`
    root: PathBuf,
    isolate_path: String,
    /// Upper bound for any memory limit, in KB (0 = none)
    memory_quota_kb: u32,
    lock: Mutex<()>,
}

impl IsolateBox {
    /// Create and initialize a new isolate box
    pub async fn new(
        isolate_path: &str,
        box_id: u32,
        memory_quota_kb: u32,
    ) -> Result<Self, SandboxError> {
        let id_flag = format!("--box-id={}", box_id);

        for attempt in 1..=INIT_ATTEMPTS {
            let output = Command::new(isolate_path)
                .args(["--cg", &id_flag, "--init"])
                .output()
                .await
                .map_err(|e| SandboxError::Tool(format!("failed to run isolate --init: {}", e)))?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let combined = format!("{}{}", stdout, stderr);

            if combined.starts_with("Box already exists") {
                info!(box_id, attempt, "Box already exists, resetting");
                cleanup_box(isolate_path, box_id, true).await;
                continue;
            }
            if combined.contains("incompatible control group mode") {
                info!(box_id, attempt, "Box created without cgroups, resetting");
                cleanup_box(isolate_path, box_id, false).await;
                continue;
            }
            if combined.starts_with("Must be started as root") {
                return Err(SandboxError::Permission(combined.trim().to_string()));
            }
            if !output.status.success() {
                return Err(SandboxError::Init {
                    box_id,
                    message: combined.trim().to_string(),
                });
            }

            let root = PathBuf::from(stdout.trim());
            debug!(box_id, path = ?root, "Initialized isolate box");
            return Ok(Self {
                box_id,
                root,
                isolate_path: isolate_path.to_string(),
                memory_quota_kb,
                lock: Mutex::new(()),
            });
        }

        Err(SandboxError::Init {
            box_id,
            message: format!("box could not be reset after {} attempts", INIT_ATTEMPTS),
        })
    }

    /// Host path of a path inside the box
    fn host_path(&self, box_path: &str) -> PathBuf {
        self.root.join(box_path.trim_start_matches('/'))
    }

    /// Translate a run configuration into isolate flags
    fn build_run_flags(&self, config: &RunConfig, meta_path: &str) -> Vec<String> {
        let mut flags = vec![format!("--box-id={}", self.box_id), "--cg".to_string()];

        if config.max_procs > 0 {
            flags.push(format!("--processes={}", config.max_procs));
        } else {
            flags.push("--processes".to_string());
        }

        flags.extend(config.directories.iter().map(|d| d.to_flag()));

        if config.inherit_env {
            flags.push("--full-env".to_string());
        }
        for var in &config.env_to_inherit {
            flags.push(format!("--env={}", var));
        }
        let mut env: Vec<_> = config.env_to_set.iter().collect();
        env.sort();
        for (key, value) in env {
            flags.push(format!("--env={}={}", key, value));
        }

        if config.time_limit_ms > 0 {
            flags.push(format!("--time={}", seconds(config.time_limit_ms)));
        }
        if config.wall_time_limit_ms > 0 {
            flags.push(format!("--wall-time={}", seconds(config.wall_time_limit_ms)));
        }

        let quota = self.memory_quota_kb;
        let memory = match config.memory_limit_kb {
            0 => quota,
            requested if quota > 0 && requested > quota => {
                info!(
                    box_id = self.box_id,
                    quota, requested, "Memory limit exceeds quota, clamping"
                );
                quota
            }
            requested => requested,
        };
        if memory > 0 {
            flags.push(format!("--cg-mem={}", memory));
        }
        if config.stack_limit_kb > 0 {
            flags.push(format!("--stack={}", config.stack_limit_kb));
        }

        flags.push(format!(
            "--stdin={}",
            config.stdin.as_deref().unwrap_or("/dev/null")
        ));
        flags.push(format!(
            "--stdout={}",
            config.stdout.as_deref().unwrap_or("/dev/null")
        ));
        if config.stderr_to_stdout {
            flags.push("--stderr-to-stdout".to_string());
        } else {
            flags.push(format!(
                "--stderr={}",
                config.stderr.as_deref().unwrap_or("/dev/null")
            ));
        }

        flags.push(format!("--meta={}", meta_path));
        flags.extend(["--silent", "--run", "--"].map(String::from));
        flags
    }

    /// One isolate invocation. The child is killed if this future is dropped.
    async fn run_once(&self, command: &[String], config: &RunConfig) -> Result<RunStats, SandboxError> {
        let meta_file = tempfile::Builder::new()
            .prefix("grading-meta-")
            .tempfile()?;
        let meta_path = meta_file.path().to_string_lossy().into_owned();

        let mut args = self.build_run_flags(config, &meta_path);
        args.extend(command.iter().cloned());
        debug!(box_id = self.box_id, "Running isolate with args: {:?}", args);

        let output = Command::new(&self.isolate_path)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SandboxError::Tool(format!("failed to run isolate: {}", e)))?;

        let mut tool_output = String::from_utf8_lossy(&output.stdout).into_owned();
        tool_output.push_str(&String::from_utf8_lossy(&output.stderr));

        let meta = fs::read_to_string(meta_file.path()).await.unwrap_or_default();
        Ok(parse_meta(&meta, &tool_output))
    }
}

#[async_trait]
impl Sandbox for IsolateBox {
    fn id(&self) -> u32 {
        self.box_id
    }

    async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<(), SandboxError> {
        let _guard = self.lock.lock().await;
        let target = self.host_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, data).await?;
        fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let _guard = self.lock.lock().await;
        match fs::read(self.host_path(path)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::MissingFile(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn file_exists(&self, path: &str) -> bool {
        let _guard = self.lock.lock().await;
        fs::metadata(self.host_path(path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn run_command(
        &self,
        command: &[String],
        config: &RunConfig,
    ) -> Result<RunStats, SandboxError> {
        let _guard = self.lock.lock().await;

        if let Some(program) = command.first() {
            if program.starts_with("/box") && !self.host_path(program).exists() {
                warn!(box_id = self.box_id, "Executable {} does not exist in sandbox", program);
            }
        }

        let mut last = Err(SandboxError::Tool("isolate was never run".to_string()));
        for attempt in 1..=RUN_RETRIES {
            last = self.run_once(command, config).await;
            let retry = match &last {
                Ok(stats) if stats.exit == ExitKind::SandboxError => {
                    warn!(
                        box_id = self.box_id,
                        attempt,
                        message = %stats.message,
                        internal = %stats.internal_message,
                        "Sandbox error, retrying"
                    );
                    true
                }
                Ok(stats) if stats.exit_code == 127 && stats.internal_message.contains("execve") => {
                    warn!(box_id = self.box_id, attempt, "Text file busy in sandbox, retrying");
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    warn!(box_id = self.box_id, attempt, "Run error in sandbox: {}", e);
                    true
                }
            };
            if !retry {
                return last;
            }
            tokio::time::sleep(RUN_RETRY_DELAY).await;
        }
        last
    }

    async fn close(&self) -> Result<(), SandboxError> {
        let _guard = self.lock.lock().await;
        let output = Command::new(&self.isolate_path)
            .args(["--cg", &format!("--box-id={}", self.box_id), "--cleanup"])
            .output()
            .await
            .map_err(|e| SandboxError::Tool(format!("failed to run isolate --cleanup: {}", e)))?;
        if !output.status.success() {
            return Err(SandboxError::Tool(format!(
                "isolate --cleanup for box {} failed: {}",
                self.box_id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(box_id = self.box_id, "Cleaned up isolate box");
        Ok(())
    }
}

async fn cleanup_box(isolate_path: &str, box_id: u32, cgroups: bool) {
    let id_flag = format!("--box-id={}", box_id);
    let mut args = vec![id_flag.as_str(), "--cleanup"];
    if cgroups {
        args.insert(0, "--cg");
    }
    match Command::new(isolate_path).args(&args).output().await {
        Ok(out) if out.status.success() => {}
        Ok(out) => warn!(
            box_id,
            "Could not clean up sandbox: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => warn!(box_id, "Could not clean up sandbox: {}", e),
    }
}

fn seconds(ms: u32) -> String {
    format!("{}", ms as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Directory;
    use std::collections::HashMap;

    fn test_box(quota: u32) -> IsolateBox {
        IsolateBox {
            box_id: 7,
            root: PathBuf::from("/var/local/lib/isolate/7"),
            isolate_path: "isolate".into(),
            memory_quota_kb: quota,
            lock: Mutex::new(()),
        }
    }

    #[test]
    fn test_run_flags_execute_shape() {
        let config = RunConfig::new()
            .with_stdin("/box/stdin")
            .with_stdout("/box/stdout")
            .with_time_limit(1500)
            .with_wall_time_limit(4000)
            .with_memory_limit(65536)
            .with_stack_limit(16384)
            .with_env(HashMap::from([("GOMAXPROCS".to_string(), "1".to_string())]))
            .with_directories([Directory::new("/etc")]);

        let flags = test_box(0).build_run_flags(&config, "/tmp/meta");

        assert_eq!(flags[0], "--box-id=7");
        assert!(flags.contains(&"--cg".to_string()));
        assert!(flags.contains(&"--processes".to_string()));
        assert!(flags.contains(&"--dir=/etc=/etc".to_string()));
        assert!(flags.contains(&"--env=GOMAXPROCS=1".to_string()));
        assert!(flags.contains(&"--time=1.5".to_string()));
        assert!(flags.contains(&"--wall-time=4".to_string()));
        assert!(flags.contains(&"--cg-mem=65536".to_string()));
        assert!(flags.contains(&"--stack=16384".to_string()));
        assert!(flags.contains(&"--stdin=/box/stdin".to_string()));
        assert!(flags.contains(&"--stderr=/dev/null".to_string()));
        assert!(flags.contains(&"--meta=/tmp/meta".to_string()));
        assert_eq!(&flags[flags.len() - 3..], ["--silent", "--run", "--"]);
    }

    #[test]
    fn test_memory_quota_clamps_limit() {
        let clamped = test_box(1024).build_run_flags(&RunConfig::new().with_memory_limit(4096), "m");
        assert!(clamped.contains(&"--cg-mem=1024".to_string()));

        let implicit = test_box(1024).build_run_flags(&RunConfig::new(), "m");
        assert!(implicit.contains(&"--cg-mem=1024".to_string()));

        let none = test_box(0).build_run_flags(&RunConfig::new(), "m");
        assert!(!none.iter().any(|f| f.starts_with("--cg-mem")));
    }

    #[test]
    fn test_stderr_merge_and_procs() {
        let config = RunConfig::new()
            .with_stdout("/box/compilation.out")
            .with_stderr_to_stdout(true)
            .with_max_procs(2)
            .with_inherit_env(true);
        let flags = test_box(0).build_run_flags(&config, "m");

        assert!(flags.contains(&"--stderr-to-stdout".to_string()));
        assert!(!flags.iter().any(|f| f.starts_with("--stderr=")));
        assert!(flags.contains(&"--processes=2".to_string()));
        assert!(flags.contains(&"--full-env".to_string()));
        assert!(flags.contains(&"--stdin=/dev/null".to_string()));
    }

    #[test]
    fn test_host_path() {
        let b = test_box(0);
        assert_eq!(
            b.host_path("/box/main.cpp"),
            PathBuf::from("/var/local/lib/isolate/7/box/main.cpp")
        );
    }
}
