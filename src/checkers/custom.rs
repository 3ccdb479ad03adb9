//! Custom checker programs
//!
//! The checker source is compiled once per submission under artifact id
//! `-submission_id` and then run in its own sandbox for every test, through
//! the submission's runner so it counts against the same limits.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Checker;
use crate::boxmanager::{BoxManager, Task};
use crate::error::{GraderError, Result, SandboxError};
use crate::languages::Language;
use crate::sandbox::{ExitKind, RunConfig, Sandbox};
use crate::store::Submission;
use crate::tasks::{compile, CompileRequest};
use crate::verdict;

pub const CHECKER_MEMORY_LIMIT_KB: u32 = 512 * 1024;
const CHECKER_WALL_TIME_MS: u32 = 20_000;
const CHECKER_MAX_PROCS: u32 = 2;

const PROGRAM_OUT: &str = "/box/program.out";
const CORRECT_IN: &str = "/box/correct.in";
const CORRECT_OUT: &str = "/box/correct.out";
const CONTESTANT_SOURCE: &str = "/box/contestant.txt";
const VERDICT_OUT: &str = "/box/checker_verdict.out";
const VERDICT_ERR: &str = "/box/checker_verdict.err";

/// Argument order and output format of a checker program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// `(programOut, correctOut, correctIn)`, stdout is `"<percentage> <message>"`
    Legacy,
    /// `(correctIn, correctOut, programOut)`, stdout is a score in `[0, 1]`,
    /// stderr the message
    Standard,
}

impl Convention {
    fn args(self) -> [&'static str; 3] {
        match self {
            Convention::Legacy => [PROGRAM_OUT, CORRECT_OUT, CORRECT_IN],
            Convention::Standard => [CORRECT_IN, CORRECT_OUT, PROGRAM_OUT],
        }
    }
}

pub struct CustomChecker {
    convention: Convention,
    language: Arc<Language>,
    code: String,
    artifact_id: i64,
    contestant_source: Vec<u8>,
    runner: BoxManager,
}

impl CustomChecker {
    pub fn new(
        convention: Convention,
        language: Arc<Language>,
        code: String,
        submission: &Submission,
        runner: BoxManager,
    ) -> Self {
        Self {
            convention,
            language,
            code,
            artifact_id: -submission.id,
            contestant_source: submission.code.clone().into_bytes(),
            runner,
        }
    }
}

#[async_trait]
impl Checker for CustomChecker {
    async fn prepare(&self) -> Result<String> {
        info!(artifact_id = self.artifact_id, language = %self.language.name, "Compiling checker");
        let req = CompileRequest::new(self.artifact_id, self.language.clone(), self.code.as_bytes())
            .with_memory_limit(CHECKER_MEMORY_LIMIT_KB);
        let resp = compile(&self.runner, req).await?;
        if !resp.success {
            let mut message = resp.output;
            if message.is_empty() {
                message = resp.other;
            }
            return Err(GraderError::Checker(message));
        }
        Ok(resp.output)
    }

    async fn run_checker(
        &self,
        program_output: &[u8],
        test_input: &[u8],
        correct_output: &[u8],
    ) -> (String, f64) {
        let program = match self.runner.artifacts().load(self.artifact_id).await {
            Ok(p) => p,
            Err(e) => return (verdict::internal_error(e), 0.0),
        };

        let mut task = CheckerRun {
            convention: self.convention,
            language: self.language.clone(),
            files: [
                (PROGRAM_OUT, program_output.to_vec()),
                (CORRECT_IN, test_input.to_vec()),
                (CORRECT_OUT, correct_output.to_vec()),
                (CONTESTANT_SOURCE, self.contestant_source.clone()),
            ],
            program,
            verdict: None,
        };
        if let Err(e) = self.runner.run_task(&mut task).await {
            warn!(artifact_id = self.artifact_id, "Checker run failed: {}", e);
            return (verdict::internal_error(e), 0.0);
        }
        task.verdict
            .unwrap_or_else(|| (verdict::internal_error("checker produced no verdict"), 0.0))
    }

    async fn cleanup(&self) -> Result<()> {
        self.runner.clean(self.artifact_id).await?;
        Ok(())
    }
}

struct CheckerRun {
    convention: Convention,
    language: Arc<Language>,
    files: [(&'static str, Vec<u8>); 4],
    program: Vec<u8>,
    verdict: Option<(String, f64)>,
}

#[async_trait]
impl Task for CheckerRun {
    async fn execute(&mut self, sandbox: &dyn Sandbox) -> Result<()> {
        sandbox
            .write_file(&self.language.compiled_name, &self.program, 0o777)
            .await?;
        for (path, data) in &self.files {
            sandbox.write_file(path, data, 0o644).await?;
        }

        let mut argv = self.language.run_command.clone();
        argv.extend(self.convention.args().iter().map(|a| a.to_string()));

        let mut config = RunConfig::new()
            .with_stdout(VERDICT_OUT)
            .with_memory_limit(CHECKER_MEMORY_LIMIT_KB)
            .with_wall_time_limit(CHECKER_WALL_TIME_MS)
            .with_max_procs(CHECKER_MAX_PROCS)
            .with_env(self.language.run_env());
        if self.convention == Convention::Standard {
            config = config.with_stderr(VERDICT_ERR);
        }
        if !self.language.compiled {
            config = config.with_directories(self.language.mounts.iter().cloned());
        }

        let stats = sandbox.run_command(&argv, &config).await?;
        debug!(box_id = sandbox.id(), exit = ?stats.exit, "Checker finished");

        // A non-zero exit is how most checkers report a wrong answer, so only
        // failures of the run itself are treated as errors
        if matches!(stats.exit, ExitKind::TimeLimit | ExitKind::SandboxError) {
            self.verdict = Some((verdict::internal_error(format!("checker: {}", stats.message)), 0.0));
            return Ok(());
        }

        let stdout = read_text(sandbox, VERDICT_OUT).await?;
        self.verdict = Some(match self.convention {
            Convention::Legacy => parse_legacy(&stdout),
            Convention::Standard => {
                let stderr = read_text(sandbox, VERDICT_ERR).await?;
                parse_standard(&stdout, &stderr)
            }
        });
        Ok(())
    }
}

/// Read a text file from the box; a missing file reads as empty
async fn read_text(sandbox: &dyn Sandbox, path: &str) -> Result<String> {
    match sandbox.read_file(path).await {
        Ok(data) => Ok(String::from_utf8_lossy(&data).into_owned()),
        Err(SandboxError::MissingFile(_)) => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

fn parse_percentage(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// `"<percentage> <message>"`
pub(crate) fn parse_legacy(output: &str) -> (String, f64) {
    let output = output.trim();
    let (number, message) = output
        .split_once(char::is_whitespace)
        .unwrap_or((output, ""));
    match parse_percentage(number) {
        Some(pct) => (message.trim().to_string(), pct),
        None => (verdict::WRONG_CHECKER_OUTPUT.to_string(), 0.0),
    }
}

/// Score in `[0, 1]` on stdout, message on stderr
pub(crate) fn parse_standard(stdout: &str, stderr: &str) -> (String, f64) {
    let Some(score) = parse_percentage(stdout.trim()) else {
        return (verdict::INVALID_CHECKER_SCORE.to_string(), 0.0);
    };
    let message = stderr.trim();
    let message = if message.is_empty() {
        verdict::NO_CHECKER_MESSAGE.to_string()
    } else {
        message.to_string()
    };
    (message, score * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::Languages;
    use crate::sandbox::fake::{FakeFactory, TOY_LANGUAGES};
    use crate::store::{ArtifactStore, SubmissionStatus};

    #[test]
    fn test_parse_legacy() {
        assert_eq!(parse_legacy("100 Correct\n"), ("Correct".to_string(), 100.0));
        assert_eq!(parse_legacy("37.5   partially right  "), ("partially right".to_string(), 37.5));
        assert_eq!(parse_legacy("0"), (String::new(), 0.0));
        assert_eq!(parse_legacy("ok 100").0, verdict::WRONG_CHECKER_OUTPUT);
        assert_eq!(parse_legacy("").1, 0.0);
        assert_eq!(parse_legacy("NaN whatever").0, verdict::WRONG_CHECKER_OUTPUT);
    }

    #[test]
    fn test_parse_standard() {
        assert_eq!(parse_standard("1\n", "ok"), ("ok".to_string(), 100.0));
        assert_eq!(parse_standard("0.25", " partial \n"), ("partial".to_string(), 25.0));
        assert_eq!(parse_standard("0.0", ""), (verdict::NO_CHECKER_MESSAGE.to_string(), 0.0));
        assert_eq!(parse_standard("", "crashed").0, verdict::INVALID_CHECKER_SCORE);
    }

    async fn checker(code: &str, convention: Convention) -> (CustomChecker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path()).await.unwrap();
        let runner = BoxManager::new(Arc::new(FakeFactory::new()), artifacts, 2, 0);
        let langs = Languages::from_toml_str(TOY_LANGUAGES).unwrap();
        let sub = Submission {
            id: 11,
            problem_id: 1,
            language: "cpp17".into(),
            code: "echo".into(),
            status: SubmissionStatus::Working,
            score: 0,
            max_time_ms: -1,
            max_memory_kb: -1,
            compile_error: false,
            compile_message: None,
        };
        let c = CustomChecker::new(convention, langs.get("cpp17").unwrap(), code.into(), &sub, runner);
        (c, dir)
    }

    #[tokio::test]
    async fn test_standard_checker_end_to_end() {
        let (c, _dir) = checker("checker-standard", Convention::Standard).await;
        c.prepare().await.unwrap();
        assert!(c.runner.artifacts().load(-11).await.is_ok());

        assert_eq!(c.run_checker(b"3\n", b"1 2", b"3").await, ("ok".to_string(), 100.0));
        assert_eq!(
            c.run_checker(b"4\n", b"1 2", b"3").await,
            ("wrong answer".to_string(), 0.0)
        );

        c.cleanup().await.unwrap();
        assert!(c.runner.artifacts().load(-11).await.is_err());
    }

    #[tokio::test]
    async fn test_legacy_checker_end_to_end() {
        let (c, _dir) = checker("checker-legacy", Convention::Legacy).await;
        c.prepare().await.unwrap();

        assert_eq!(c.run_checker(b"3", b"", b"3").await, ("Correct".to_string(), 100.0));
        assert_eq!(c.run_checker(b"2", b"", b"3").await, ("Wrong".to_string(), 0.0));
    }

    #[tokio::test]
    async fn test_malformed_checker_output() {
        let (c, _dir) = checker("checker-garbage", Convention::Legacy).await;
        c.prepare().await.unwrap();

        let (msg, pct) = c.run_checker(b"3", b"", b"3").await;
        assert_eq!(msg, verdict::WRONG_CHECKER_OUTPUT);
        assert_eq!(pct, 0.0);
    }

    #[tokio::test]
    async fn test_checker_compile_failure() {
        let (c, _dir) = checker("#error broken checker", Convention::Standard).await;

        match c.prepare().await {
            Err(GraderError::Checker(msg)) => assert!(msg.contains("error")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
