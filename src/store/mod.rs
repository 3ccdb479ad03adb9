//! Persistence collaborators
//!
//! The grading engine does not own a database. It talks to two traits:
//! - `SubmissionStore`: submissions, problems, tests, subtasks and the
//!   per-submission SubTest / SubmissionSubTask rows
//! - `DataStore`: byte blobs for test input/output and SubTest output
//!
//! `MemoryStore` implements both and backs the tests. `FsDataStore` and
//! `S3DataStore` are the production blob backends. Compile artifacts live in
//! the separate `ArtifactStore`.

pub mod artifacts;
pub mod fs;
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use artifacts::ArtifactStore;
pub use fs::FsDataStore;
pub use memory::MemoryStore;
pub use s3::S3DataStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Submission lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Creating,
    Waiting,
    Working,
    Finished,
    /// Queued for a fresh grading pass
    Reevaluating,
}

/// How a problem's submissions are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringType {
    /// Partial scoring; tests may run in any order
    #[default]
    Classic,
    /// Pass/fail with a strict test order
    Icpc,
}

/// Source of a custom checker attached to a problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerProgram {
    /// File name; its extension selects the language
    pub filename: String,
    pub code: String,
    /// Use the `(programOut, correctOut, correctIn)` convention
    #[serde(default)]
    pub legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: i64,
    pub name: String,
    pub time_limit_ms: u32,
    pub memory_limit_kb: u32,
    pub stack_limit_kb: u32,
    /// Floor score added to every computed total
    pub default_points: i64,
    pub scoring: ScoringType,
    /// File-based I/O name (`<name>.in` / `<name>.out`); `None` means console
    pub io_filename: Option<String>,
    pub checker: Option<CheckerProgram>,
}

impl Problem {
    pub fn input_name(&self) -> String {
        match &self.io_filename {
            Some(name) => format!("{}.in", name),
            None => "stdin".to_string(),
        }
    }

    pub fn output_name(&self) -> String {
        match &self.io_filename {
            Some(name) => format!("{}.out", name),
            None => "stdout".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: i64,
    pub problem_id: i64,
    pub visible_id: i32,
    /// Weight in flat scoring
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: i64,
    pub problem_id: i64,
    pub visible_id: i32,
    pub score: i64,
    /// Member test ids
    pub tests: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub problem_id: i64,
    pub language: String,
    pub code: String,
    pub status: SubmissionStatus,
    pub score: i64,
    /// -1 until at least one test ran
    pub max_time_ms: i64,
    pub max_memory_kb: i64,
    pub compile_error: bool,
    pub compile_message: Option<String>,
}

/// Grading record for one (submission, test) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTest {
    pub id: i64,
    pub submission_id: i64,
    pub test_id: i64,
    pub visible_id: i32,
    pub verdict: String,
    pub time_ms: u32,
    pub memory_kb: u32,
    /// Percentage in [0, 100]
    pub percentage: f64,
    pub done: bool,
}

/// Grading record for one (submission, subtask) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionSubTask {
    pub id: i64,
    pub submission_id: i64,
    pub subtask_id: i64,
    pub visible_id: i32,
    pub score: i64,
    /// Member SubTest ids, in test order
    pub subtests: Vec<i64>,
    pub final_percentage: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct SubmissionFilter {
    pub status: Option<SubmissionStatus>,
    pub ascending: bool,
    pub limit: Option<usize>,
}

impl SubmissionFilter {
    /// Oldest `limit` submissions in `status`
    pub fn oldest(status: SubmissionStatus, limit: usize) -> Self {
        Self {
            status: Some(status),
            ascending: true,
            limit: Some(limit),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionUpdate {
    pub status: Option<SubmissionStatus>,
    pub score: Option<i64>,
    pub max_time_ms: Option<i64>,
    pub max_memory_kb: Option<i64>,
    pub compile_error: Option<bool>,
    pub compile_message: Option<String>,
}

impl SubmissionUpdate {
    pub fn status(status: SubmissionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubTestUpdate {
    pub verdict: Option<String>,
    pub time_ms: Option<u32>,
    pub memory_kb: Option<u32>,
    pub percentage: Option<f64>,
    pub done: Option<bool>,
}

/// Submission-side persistence
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn submissions(&self, filter: &SubmissionFilter) -> StoreResult<Vec<Submission>>;
    async fn submission(&self, id: i64) -> StoreResult<Submission>;
    async fn update_submission(&self, id: i64, update: SubmissionUpdate) -> StoreResult<()>;

    async fn problem(&self, id: i64) -> StoreResult<Problem>;
    async fn tests(&self, problem_id: i64) -> StoreResult<Vec<Test>>;
    async fn subtasks(&self, problem_id: i64) -> StoreResult<Vec<Subtask>>;

    async fn subtests(&self, submission_id: i64) -> StoreResult<Vec<SubTest>>;
    async fn update_subtest(&self, id: i64, update: SubTestUpdate) -> StoreResult<()>;

    async fn submission_subtasks(&self, submission_id: i64) -> StoreResult<Vec<SubmissionSubTask>>;
    async fn update_submission_subtask(&self, id: i64, percentage: f64) -> StoreResult<()>;

    /// Clear every per-test and per-subtask result and put the submission
    /// back in `waiting`
    async fn reset_submission(&self, id: i64) -> StoreResult<()>;

    /// Create a submission with its SubTests and SubmissionSubTasks, then
    /// move it to `waiting`
    async fn create_submission(&self, problem_id: i64, language: &str, code: &str) -> StoreResult<Submission>;

    /// Register a problem with one test per entry of `test_scores`. Each
    /// subtask is `(score, positions in test_scores)`. Returns the stored
    /// problem and its tests in the given order.
    async fn create_problem(
        &self,
        problem: Problem,
        test_scores: &[i64],
        subtasks: &[(i64, Vec<usize>)],
    ) -> StoreResult<(Problem, Vec<Test>)>;
}

/// Blob persistence keyed by numeric ids
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn test_input(&self, test_id: i64) -> StoreResult<Vec<u8>>;
    async fn test_output(&self, test_id: i64) -> StoreResult<Vec<u8>>;
    async fn subtest_output(&self, subtest_id: i64) -> StoreResult<Vec<u8>>;
    async fn save_subtest_output(&self, subtest_id: i64, data: &[u8]) -> StoreResult<()>;
    async fn save_test(&self, test_id: i64, input: &[u8], output: &[u8]) -> StoreResult<()>;
}
