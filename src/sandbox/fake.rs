//! In-memory sandbox for tests
//!
//! Files live in a map and commands are interpreted by a toy runtime: the
//! "compiler" copies the source to the compiled name (or fails when the
//! source contains `#error`), and the "program" is the first line of that
//! artifact, e.g. `echo`, `print 42`, `tle`, `crash`, `segv`, `oom`,
//! `silent`, `panic`, `panicif <input>`, `checker-standard`, `checker-legacy`,
//! `checker-garbage`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ExitKind, RunConfig, RunStats, Sandbox, SandboxFactory};
use crate::error::SandboxError;

/// Counts live sandboxes so tests can assert the concurrency bound
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    in_use: AtomicUsize,
    peak: AtomicUsize,
    created: AtomicUsize,
    closed: AtomicUsize,
}

impl Tracker {
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn acquire(&self) {
        self.created.fetch_add(1, Ordering::SeqCst);
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn release(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    pub(crate) tracker: Arc<Tracker>,
    /// Extra latency added to every command
    pub(crate) run_delay: Duration,
    pub(crate) fail_create: AtomicBool,
    /// Box ids handed out so far, in order
    pub(crate) ids: Mutex<Vec<u32>>,
}

impl FakeFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_run_delay(delay: Duration) -> Self {
        Self {
            run_delay: delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl SandboxFactory for FakeFactory {
    async fn create(&self, box_id: u32) -> Result<Box<dyn Sandbox>, SandboxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::Permission("Must be started as root".into()));
        }
        self.ids.lock().unwrap().push(box_id);
        self.tracker.acquire();
        Ok(Box::new(FakeSandbox {
            id: box_id,
            files: Mutex::new(HashMap::new()),
            tracker: self.tracker.clone(),
            run_delay: self.run_delay,
            lock: tokio::sync::Mutex::new(()),
        }))
    }
}

pub(crate) struct FakeSandbox {
    id: u32,
    files: Mutex<HashMap<String, Vec<u8>>>,
    tracker: Arc<Tracker>,
    run_delay: Duration,
    lock: tokio::sync::Mutex<()>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> u32 {
        self.id
    }

    async fn write_file(&self, path: &str, data: &[u8], _mode: u32) -> Result<(), SandboxError> {
        let _guard = self.lock.lock().await;
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let _guard = self.lock.lock().await;
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::MissingFile(path.to_string()))
    }

    async fn file_exists(&self, path: &str) -> bool {
        let _guard = self.lock.lock().await;
        self.files.lock().unwrap().contains_key(path)
    }

    async fn run_command(
        &self,
        command: &[String],
        config: &RunConfig,
    ) -> Result<RunStats, SandboxError> {
        let _guard = self.lock.lock().await;
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        let mut files = self.files.lock().unwrap();
        Ok(toy_run(command, config, &mut files))
    }

    async fn close(&self) -> Result<(), SandboxError> {
        self.tracker.release();
        Ok(())
    }
}

fn toy_run(command: &[String], config: &RunConfig, files: &mut HashMap<String, Vec<u8>>) -> RunStats {
    let mut stats = RunStats {
        time_ms: 10,
        wall_time_ms: 12,
        memory_kb: 1024,
        ..Default::default()
    };

    if config.stdout.as_deref() == Some("/box/compilation.out") {
        return toy_compile(command, files, stats);
    }

    let Some(program) = command.iter().find_map(|arg| files.get(arg).cloned()) else {
        stats.exit = ExitKind::RuntimeError;
        stats.exit_code = 127;
        stats.message = "Exited with error status 127".into();
        return stats;
    };
    let program = String::from_utf8_lossy(&program).into_owned();
    let line = program.lines().next().unwrap_or_default().trim().to_string();
    let mut words = line.split_whitespace();
    let op = words.next().unwrap_or_default();

    let input = match &config.stdin {
        Some(path) => files.get(path).cloned().unwrap_or_default(),
        None => files
            .iter()
            .find(|(name, _)| name.ends_with(".in") && !name.ends_with("correct.in"))
            .map(|(_, data)| data.clone())
            .unwrap_or_default(),
    };
    let output_path = config.stdout.clone().or_else(|| {
        files
            .keys()
            .find(|name| name.ends_with(".in") && !name.ends_with("correct.in"))
            .map(|name| format!("{}out", name.trim_end_matches("in")))
    });

    let mut write_out = |data: Vec<u8>| {
        if let Some(path) = &output_path {
            files.insert(path.clone(), data);
        }
    };

    match op {
        "echo" => write_out(input),
        "print" => write_out(format!("{}\n", words.collect::<Vec<_>>().join(" ")).into_bytes()),
        "slow" => {
            stats.time_ms = words.next().and_then(|w| w.parse().ok()).unwrap_or(10);
            write_out(input);
        }
        "tle" => {
            stats.time_ms = config.time_limit_ms + 250;
            stats.exit = ExitKind::TimeLimit;
            stats.killed = true;
            stats.message = "Time limit exceeded".into();
        }
        "walltle" => {
            stats.wall_time_ms = config.wall_time_limit_ms + 1;
            stats.exit = ExitKind::TimeLimit;
            stats.killed = true;
            stats.message = "Time limit exceeded (wall clock)".into();
        }
        "crash" => {
            stats.exit = ExitKind::RuntimeError;
            stats.exit_code = 1;
            stats.message = "Exited with error status 1".into();
        }
        "segv" => {
            stats.exit = ExitKind::Signaled;
            stats.exit_signal = Some(11);
            stats.message = "Caught fatal signal 11".into();
        }
        "oom" => {
            stats.memory_kb = config.memory_limit_kb;
            stats.memory_limit_exceeded = true;
        }
        "sandboxfail" => {
            stats.exit = ExitKind::SandboxError;
            stats.message = "execve failed".into();
        }
        "silent" => {}
        "panic" => panic!("toy program asked to panic"),
        "panicif" => {
            let word = words.next().unwrap_or_default();
            if String::from_utf8_lossy(&input).trim() == word {
                panic!("toy program panicked on input {:?}", word);
            }
            write_out(input);
        }
        "checker-standard" => {
            let correct = trimmed(files.get("/box/correct.out"));
            let produced = trimmed(files.get("/box/program.out"));
            let (score, msg) = if correct == produced { ("1", "ok") } else { ("0.0", "wrong answer") };
            files.insert("/box/checker_verdict.out".into(), format!("{}\n", score).into_bytes());
            files.insert("/box/checker_verdict.err".into(), msg.as_bytes().to_vec());
        }
        "checker-legacy" => {
            let correct = trimmed(files.get("/box/correct.out"));
            let produced = trimmed(files.get("/box/program.out"));
            let verdict = if correct == produced { "100 Correct" } else { "0 Wrong" };
            files.insert("/box/checker_verdict.out".into(), verdict.as_bytes().to_vec());
        }
        "checker-garbage" => {
            files.insert("/box/checker_verdict.out".into(), b"definitely not a number".to_vec());
        }
        _ => {
            stats.exit = ExitKind::RuntimeError;
            stats.exit_code = 2;
            stats.message = format!("unknown toy program {:?}", op);
        }
    }
    stats
}

fn toy_compile(command: &[String], files: &mut HashMap<String, Vec<u8>>, mut stats: RunStats) -> RunStats {
    let sources: Vec<Vec<u8>> = command.iter().filter_map(|arg| files.get(arg).cloned()).collect();
    let source = sources.concat();
    let output_idx = command.iter().position(|a| a == "-o").map(|i| i + 1);
    let target = output_idx
        .and_then(|i| command.get(i))
        .cloned()
        .unwrap_or_else(|| "/box/output".into());

    if String::from_utf8_lossy(&source).contains("#error") || sources.is_empty() {
        files.insert(
            "/box/compilation.out".into(),
            b"main.cpp:1:2: error: #error forced failure".to_vec(),
        );
        stats.exit = ExitKind::RuntimeError;
        stats.exit_code = 1;
        stats.message = "Exited with error status 1".into();
        return stats;
    }

    files.insert("/box/compilation.out".into(), Vec::new());
    files.insert(target, source);
    stats
}

fn trimmed(data: Option<&Vec<u8>>) -> String {
    data.map(|d| String::from_utf8_lossy(d).trim().to_string())
        .unwrap_or_default()
}

/// Language file used by tests; commands are interpreted by the toy runtime
pub(crate) const TOY_LANGUAGES: &str = r#"
[cpp17]
printable_name = "C++17"
extensions = [".cpp"]
compiled = true
compile_command = ["g++", "-O2", "<REPLACE>", "-o", "/box/output"]
run_command = ["/box/output"]
source_name = "/box/main.cpp"
compiled_name = "/box/output"

[python3]
printable_name = "Python 3"
extensions = [".py"]
compiled = false
run_command = ["python3", "/box/main.py"]
source_name = "/box/main.py"
compiled_name = "/box/main.py"
"#;
