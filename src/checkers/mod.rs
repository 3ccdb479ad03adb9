//! Checkers - scoring one test's output against the expected output
//!
//! Three variants behind one trait:
//! - `DiffChecker`: whitespace-tolerant comparison, no sandbox needed
//! - `CustomChecker` with the legacy convention: argv is
//!   `(programOut, correctOut, correctIn)` and the verdict file holds
//!   `"<percentage> <message>"`
//! - `CustomChecker` with the standard convention: argv is
//!   `(correctIn, correctOut, programOut)`, stdout holds a score in `[0, 1]`
//!   and stderr the message
//!
//! `checker_for` picks the variant from the problem settings.

pub mod custom;
pub mod diff;

use std::sync::Arc;

use async_trait::async_trait;

use crate::boxmanager::BoxManager;
use crate::error::{GraderError, Result};
use crate::languages::Languages;
use crate::store::{Problem, Submission};

pub use custom::{Convention, CustomChecker};
pub use diff::DiffChecker;

#[async_trait]
pub trait Checker: Send + Sync {
    /// One-time setup before any test is checked.
    ///
    /// Returns a diagnostic (e.g. compiler warnings). A checker that cannot be
    /// made ready fails with `GraderError::Checker` carrying the message to show.
    async fn prepare(&self) -> Result<String>;

    /// Score one output; returns the verdict message and a percentage in `0..=100`
    async fn run_checker(
        &self,
        program_output: &[u8],
        test_input: &[u8],
        correct_output: &[u8],
    ) -> (String, f64);

    async fn cleanup(&self) -> Result<()>;
}

/// Pick the checker for `problem`. Custom checkers run through `runner`.
pub fn checker_for(
    problem: &Problem,
    submission: &Submission,
    languages: &Languages,
    runner: &BoxManager,
) -> Result<Arc<dyn Checker>> {
    let Some(program) = &problem.checker else {
        return Ok(Arc::new(DiffChecker));
    };

    let language = languages
        .by_filename(&program.filename)
        .ok_or_else(|| GraderError::UnknownLanguage(program.filename.clone()))?;
    let convention = if program.legacy {
        Convention::Legacy
    } else {
        Convention::Standard
    };

    Ok(Arc::new(CustomChecker::new(
        convention,
        language,
        program.code.clone(),
        submission,
        runner.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::{FakeFactory, TOY_LANGUAGES};
    use crate::store::memory::fixtures::{problem, with_checker};
    use crate::store::{ArtifactStore, SubmissionStatus};

    fn submission() -> Submission {
        Submission {
            id: 3,
            problem_id: 1,
            language: "cpp17".into(),
            code: "echo".into(),
            status: SubmissionStatus::Working,
            score: 0,
            max_time_ms: -1,
            max_memory_kb: -1,
            compile_error: false,
            compile_message: None,
        }
    }

    #[tokio::test]
    async fn test_factory_selects_variant() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path()).await.unwrap();
        let runner = BoxManager::new(Arc::new(FakeFactory::new()), artifacts, 1, 0);
        let langs = Languages::from_toml_str(TOY_LANGUAGES).unwrap();
        let sub = submission();

        let diff = checker_for(&problem(0), &sub, &langs, &runner).unwrap();
        assert_eq!(diff.run_checker(b"5\n", b"", b"5").await.1, 100.0);

        let custom = with_checker(problem(0), "checker-legacy", true);
        assert!(checker_for(&custom, &sub, &langs, &runner).is_ok());

        let mut unknown = with_checker(problem(0), "checker-legacy", false);
        if let Some(c) = unknown.checker.as_mut() {
            c.filename = "checker.pas".into();
        }
        assert!(matches!(
            checker_for(&unknown, &sub, &langs, &runner),
            Err(GraderError::UnknownLanguage(_))
        ));
    }
}
