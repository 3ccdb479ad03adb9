//! In-memory implementation of both persistence traits

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    DataStore, Problem, StoreResult, SubTest, SubTestUpdate, Submission, SubmissionFilter,
    SubmissionStatus, SubmissionStore, SubmissionSubTask, SubmissionUpdate, Subtask, Test,
};
use crate::error::StoreError;

#[derive(Default)]
struct State {
    next_id: i64,
    problems: HashMap<i64, Problem>,
    tests: BTreeMap<i64, Test>,
    subtasks: BTreeMap<i64, Subtask>,
    submissions: BTreeMap<i64, Submission>,
    subtests: BTreeMap<i64, SubTest>,
    sub_subtasks: BTreeMap<i64, SubmissionSubTask>,
    inputs: HashMap<i64, Vec<u8>>,
    outputs: HashMap<i64, Vec<u8>>,
    subtest_outputs: HashMap<i64, Vec<u8>>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_problem(&mut self, mut problem: Problem) -> Problem {
        problem.id = self.id();
        self.problems.insert(problem.id, problem.clone());
        problem
    }

    fn insert_test(&mut self, problem_id: i64, score: i64) -> Test {
        let visible_id = self.tests.values().filter(|t| t.problem_id == problem_id).count() as i32 + 1;
        let test = Test {
            id: self.id(),
            problem_id,
            visible_id,
            score,
        };
        self.tests.insert(test.id, test.clone());
        test
    }

    fn insert_subtask(&mut self, problem_id: i64, score: i64, tests: Vec<i64>) -> Subtask {
        let visible_id = self.subtasks.values().filter(|s| s.problem_id == problem_id).count() as i32 + 1;
        let subtask = Subtask {
            id: self.id(),
            problem_id,
            visible_id,
            score,
            tests,
        };
        self.subtasks.insert(subtask.id, subtask.clone());
        subtask
    }
}

/// Store keeping everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    /// Insert a problem; its id is assigned by the store
    pub fn add_problem(&self, problem: Problem) -> StoreResult<Problem> {
        Ok(self.lock()?.insert_problem(problem))
    }

    /// Attach a test with its input and expected output
    pub fn add_test(&self, problem_id: i64, score: i64, input: &[u8], output: &[u8]) -> StoreResult<Test> {
        let mut state = self.lock()?;
        let test = state.insert_test(problem_id, score);
        state.inputs.insert(test.id, input.to_vec());
        state.outputs.insert(test.id, output.to_vec());
        Ok(test)
    }

    pub fn add_subtask(&self, problem_id: i64, score: i64, tests: Vec<i64>) -> StoreResult<Subtask> {
        Ok(self.lock()?.insert_subtask(problem_id, score, tests))
    }

    /// Drop a test, leaving any SubTests that referenced it orphaned
    pub fn remove_test(&self, test_id: i64) -> StoreResult<()> {
        let mut state = self.lock()?;
        state.tests.remove(&test_id);
        state.inputs.remove(&test_id);
        state.outputs.remove(&test_id);
        Ok(())
    }

    /// Set a submission's status directly (queueing a re-evaluation, tests)
    pub fn set_status(&self, id: i64, status: SubmissionStatus) -> StoreResult<()> {
        let mut state = self.lock()?;
        let sub = state
            .submissions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("submission", id))?;
        sub.status = status;
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn submissions(&self, filter: &SubmissionFilter) -> StoreResult<Vec<Submission>> {
        let state = self.lock()?;
        let matching = state
            .submissions
            .values()
            .filter(|s| filter.status.map_or(true, |st| s.status == st))
            .cloned();
        let mut subs: Vec<Submission> = if filter.ascending {
            matching.collect()
        } else {
            matching.rev().collect()
        };
        if let Some(limit) = filter.limit {
            subs.truncate(limit);
        }
        Ok(subs)
    }

    async fn submission(&self, id: i64) -> StoreResult<Submission> {
        self.lock()?
            .submissions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("submission", id))
    }

    async fn update_submission(&self, id: i64, update: SubmissionUpdate) -> StoreResult<()> {
        let mut state = self.lock()?;
        let sub = state
            .submissions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("submission", id))?;
        if let Some(status) = update.status {
            sub.status = status;
        }
        if let Some(score) = update.score {
            sub.score = score;
        }
        if let Some(time) = update.max_time_ms {
            sub.max_time_ms = time;
        }
        if let Some(memory) = update.max_memory_kb {
            sub.max_memory_kb = memory;
        }
        if let Some(compile_error) = update.compile_error {
            sub.compile_error = compile_error;
        }
        if let Some(message) = update.compile_message {
            sub.compile_message = Some(message);
        }
        Ok(())
    }

    async fn problem(&self, id: i64) -> StoreResult<Problem> {
        self.lock()?
            .problems
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("problem", id))
    }

    async fn tests(&self, problem_id: i64) -> StoreResult<Vec<Test>> {
        Ok(self
            .lock()?
            .tests
            .values()
            .filter(|t| t.problem_id == problem_id)
            .cloned()
            .collect())
    }

    async fn subtasks(&self, problem_id: i64) -> StoreResult<Vec<Subtask>> {
        Ok(self
            .lock()?
            .subtasks
            .values()
            .filter(|s| s.problem_id == problem_id)
            .cloned()
            .collect())
    }

    async fn subtests(&self, submission_id: i64) -> StoreResult<Vec<SubTest>> {
        Ok(self
            .lock()?
            .subtests
            .values()
            .filter(|st| st.submission_id == submission_id)
            .cloned()
            .collect())
    }

    async fn update_subtest(&self, id: i64, update: SubTestUpdate) -> StoreResult<()> {
        let mut state = self.lock()?;
        let st = state
            .subtests
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("subtest", id))?;
        if let Some(verdict) = update.verdict {
            st.verdict = verdict;
        }
        if let Some(time) = update.time_ms {
            st.time_ms = time;
        }
        if let Some(memory) = update.memory_kb {
            st.memory_kb = memory;
        }
        if let Some(pct) = update.percentage {
            st.percentage = pct;
        }
        if let Some(done) = update.done {
            st.done = done;
        }
        Ok(())
    }

    async fn submission_subtasks(&self, submission_id: i64) -> StoreResult<Vec<SubmissionSubTask>> {
        Ok(self
            .lock()?
            .sub_subtasks
            .values()
            .filter(|s| s.submission_id == submission_id)
            .cloned()
            .collect())
    }

    async fn update_submission_subtask(&self, id: i64, percentage: f64) -> StoreResult<()> {
        let mut state = self.lock()?;
        let sst = state
            .sub_subtasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("submission subtask", id))?;
        sst.final_percentage = Some(percentage);
        Ok(())
    }

    async fn reset_submission(&self, id: i64) -> StoreResult<()> {
        let mut state = self.lock()?;
        let sub = state
            .submissions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("submission", id))?;
        sub.status = SubmissionStatus::Waiting;
        sub.score = 0;
        sub.max_time_ms = -1;
        sub.max_memory_kb = -1;
        sub.compile_error = false;
        sub.compile_message = None;

        let mut cleared = Vec::new();
        for st in state.subtests.values_mut().filter(|st| st.submission_id == id) {
            st.verdict.clear();
            st.time_ms = 0;
            st.memory_kb = 0;
            st.percentage = 0.0;
            st.done = false;
            cleared.push(st.id);
        }
        for sst in state.sub_subtasks.values_mut().filter(|s| s.submission_id == id) {
            sst.final_percentage = None;
        }
        for subtest_id in cleared {
            state.subtest_outputs.remove(&subtest_id);
        }
        Ok(())
    }

    async fn create_submission(&self, problem_id: i64, language: &str, code: &str) -> StoreResult<Submission> {
        let mut state = self.lock()?;
        if !state.problems.contains_key(&problem_id) {
            return Err(StoreError::not_found("problem", problem_id));
        }

        let mut sub = Submission {
            id: state.id(),
            problem_id,
            language: language.to_string(),
            code: code.to_string(),
            status: SubmissionStatus::Creating,
            score: 0,
            max_time_ms: -1,
            max_memory_kb: -1,
            compile_error: false,
            compile_message: None,
        };
        state.submissions.insert(sub.id, sub.clone());

        let tests: Vec<Test> = state
            .tests
            .values()
            .filter(|t| t.problem_id == problem_id)
            .cloned()
            .collect();
        let mut by_test = HashMap::new();
        for test in tests {
            let st = SubTest {
                id: state.id(),
                submission_id: sub.id,
                test_id: test.id,
                visible_id: test.visible_id,
                verdict: String::new(),
                time_ms: 0,
                memory_kb: 0,
                percentage: 0.0,
                done: false,
            };
            by_test.insert(test.id, st.id);
            state.subtests.insert(st.id, st);
        }

        let subtasks: Vec<Subtask> = state
            .subtasks
            .values()
            .filter(|s| s.problem_id == problem_id)
            .cloned()
            .collect();
        for subtask in subtasks {
            let sst = SubmissionSubTask {
                id: state.id(),
                submission_id: sub.id,
                subtask_id: subtask.id,
                visible_id: subtask.visible_id,
                score: subtask.score,
                subtests: subtask.tests.iter().filter_map(|t| by_test.get(t).copied()).collect(),
                final_percentage: None,
            };
            state.sub_subtasks.insert(sst.id, sst);
        }

        sub.status = SubmissionStatus::Waiting;
        state.submissions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn create_problem(
        &self,
        problem: Problem,
        test_scores: &[i64],
        subtasks: &[(i64, Vec<usize>)],
    ) -> StoreResult<(Problem, Vec<Test>)> {
        if let Some(pos) = subtasks
            .iter()
            .flat_map(|(_, members)| members)
            .find(|&&pos| pos >= test_scores.len())
        {
            return Err(StoreError::Invalid(format!(
                "subtask refers to test #{} but the problem has {} tests",
                pos + 1,
                test_scores.len()
            )));
        }

        let mut state = self.lock()?;
        let problem = state.insert_problem(problem);
        let tests: Vec<Test> = test_scores
            .iter()
            .map(|&score| state.insert_test(problem.id, score))
            .collect();
        for (score, members) in subtasks {
            let ids = members.iter().map(|&pos| tests[pos].id).collect();
            state.insert_subtask(problem.id, *score, ids);
        }
        Ok((problem, tests))
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn test_input(&self, test_id: i64) -> StoreResult<Vec<u8>> {
        self.lock()?
            .inputs
            .get(&test_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("test input", test_id))
    }

    async fn test_output(&self, test_id: i64) -> StoreResult<Vec<u8>> {
        self.lock()?
            .outputs
            .get(&test_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("test output", test_id))
    }

    async fn subtest_output(&self, subtest_id: i64) -> StoreResult<Vec<u8>> {
        self.lock()?
            .subtest_outputs
            .get(&subtest_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("subtest output", subtest_id))
    }

    async fn save_subtest_output(&self, subtest_id: i64, data: &[u8]) -> StoreResult<()> {
        self.lock()?.subtest_outputs.insert(subtest_id, data.to_vec());
        Ok(())
    }

    async fn save_test(&self, test_id: i64, input: &[u8], output: &[u8]) -> StoreResult<()> {
        let mut state = self.lock()?;
        state.inputs.insert(test_id, input.to_vec());
        state.outputs.insert(test_id, output.to_vec());
        Ok(())
    }
}
