//! Driving one submission
//!
//! compile -> prepare checker -> one worker per SubTest -> score. The
//! grading itself runs in its own task; whatever happens to it, `finalize`
//! runs afterwards and leaves the submission `finished` with every SubTest
//! done.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::Shared;
use crate::boxmanager::BoxManager;
use crate::checkers::{checker_for, Checker};
use crate::error::{GraderError, Result};
use crate::languages::Language;
use crate::scoring::{self, clamp_percentage};
use crate::store::{
    Problem, ScoringType, SubTest, SubTestUpdate, Submission, SubmissionStatus, SubmissionUpdate,
};
use crate::tasks::{compile, execute, CompileRequest, ExecRequest};
use crate::verdict;

pub(super) async fn drive(shared: Arc<Shared>, sub: Submission) {
    let id = sub.id;
    let started = Instant::now();
    info!(submission_id = id, problem_id = sub.problem_id, "Grading submission");

    let graded = tokio::spawn(grade(Arc::clone(&shared), sub)).await;
    let failed = match graded {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!(submission_id = id, "Grading failed: {}", e);
            true
        }
        Err(e) => {
            error!(submission_id = id, "Grading task died: {}", e);
            true
        }
    };

    finalize(&shared, id, failed).await;
    info!(
        submission_id = id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Submission finished"
    );
}

async fn grade(shared: Arc<Shared>, sub: Submission) -> Result<()> {
    let store = &shared.submissions;
    let problem = Arc::new(store.problem(sub.problem_id).await?);

    let Some(language) = shared.languages.get(&sub.language) else {
        let message = GraderError::UnknownLanguage(sub.language.clone()).to_string();
        return fail_compile(&shared, &sub, &problem, message).await;
    };

    let concurrency = match problem.scoring {
        ScoringType::Classic => shared.boxes.num_concurrent(),
        ScoringType::Icpc => 1,
    };
    let runner = shared.boxes.sub_runner(concurrency)?;

    let req = CompileRequest::new(sub.id, language.clone(), sub.code.as_bytes());
    let compiled = compile(&runner, req).await?;
    if !compiled.success {
        if !compiled.other.is_empty() {
            debug!(submission_id = sub.id, "Compile diagnostic: {}", compiled.other);
        }
        return fail_compile(&shared, &sub, &problem, compiled.output).await;
    }
    let update = SubmissionUpdate {
        compile_error: Some(false),
        compile_message: Some(compiled.output),
        ..Default::default()
    };
    store.update_submission(sub.id, update).await?;

    let checker = match checker_for(&problem, &sub, &shared.languages, &runner) {
        Ok(c) => c,
        Err(GraderError::UnknownLanguage(name)) => {
            let message = format!("Checker language not available: {}", name);
            return fail_compile(&shared, &sub, &problem, message).await;
        }
        Err(e) => return Err(e),
    };
    match checker.prepare().await {
        Ok(_) => {}
        Err(GraderError::Checker(message)) => {
            warn!(submission_id = sub.id, "Checker failed to prepare");
            return fail_compile(&shared, &sub, &problem, message).await;
        }
        Err(e) => return Err(e),
    }

    let mut subtests = store.subtests(sub.id).await?;
    subtests.sort_by_key(|st| st.id);
    let job = Arc::new(SubTestJob {
        shared: Arc::clone(&shared),
        runner,
        checker: Arc::clone(&checker),
        problem: Arc::clone(&problem),
        language,
        submission_id: sub.id,
    });

    match problem.scoring {
        // Strict id order, one at a time
        ScoringType::Icpc => {
            for st in subtests {
                let id = st.id;
                let handle = tokio::spawn(Arc::clone(&job).run(st));
                join_worker(&shared, id, handle).await;
            }
        }
        ScoringType::Classic => {
            let handles: Vec<_> = subtests
                .into_iter()
                .map(|st| (st.id, tokio::spawn(Arc::clone(&job).run(st))))
                .collect();
            for (id, handle) in handles {
                join_worker(&shared, id, handle).await;
            }
        }
    }

    if let Err(e) = checker.cleanup().await {
        warn!(submission_id = sub.id, "Couldn't clean checker: {}", e);
    }
    persist_score(&shared, sub.id, &problem).await
}

/// Wait for one SubTest worker; a worker that died only costs its own SubTest
async fn join_worker(shared: &Shared, subtest_id: i64, handle: tokio::task::JoinHandle<()>) {
    let Err(e) = handle.await else {
        return;
    };
    error!(subtest_id, "SubTest worker died: {}", e);
    let update = SubTestUpdate {
        verdict: Some(verdict::internal_error("worker crashed")),
        percentage: Some(0.0),
        done: Some(true),
        ..Default::default()
    };
    if let Err(e) = shared.submissions.update_subtest(subtest_id, update).await {
        warn!(subtest_id, "Couldn't record crashed SubTest: {}", e);
    }
}

/// Everything a SubTest worker needs
struct SubTestJob {
    shared: Arc<Shared>,
    runner: BoxManager,
    checker: Arc<dyn Checker>,
    problem: Arc<Problem>,
    language: Arc<Language>,
    submission_id: i64,
}

impl SubTestJob {
    async fn run(self: Arc<Self>, st: SubTest) {
        let req = ExecRequest {
            submission_id: self.submission_id,
            subtest_id: st.id,
            test_id: st.test_id,
            input_name: self.problem.input_name(),
            output_name: self.problem.output_name(),
            time_limit_ms: self.problem.time_limit_ms,
            memory_limit_kb: self.problem.memory_limit_kb,
            stack_limit_kb: self.problem.stack_limit_kb,
            language: Arc::clone(&self.language),
        };
        let resp = execute(&self.runner, self.shared.data.as_ref(), req).await;

        let (message, percentage) = if resp.is_clean() {
            self.check(&st).await
        } else {
            (resp.comments.clone(), 0.0)
        };
        debug!(subtest_id = st.id, verdict = %message, percentage, "SubTest graded");

        let update = SubTestUpdate {
            verdict: Some(message),
            time_ms: Some(resp.time_ms),
            memory_kb: Some(resp.memory_kb),
            percentage: Some(clamp_percentage(percentage)),
            done: Some(true),
        };
        if let Err(e) = self.shared.submissions.update_subtest(st.id, update).await {
            warn!(subtest_id = st.id, "Couldn't save SubTest result: {}", e);
        }
    }

    async fn check(&self, st: &SubTest) -> (String, f64) {
        let data = &self.shared.data;
        let loaded = async {
            let output = data.subtest_output(st.id).await?;
            let input = data.test_input(st.test_id).await?;
            let correct = data.test_output(st.test_id).await?;
            Ok::<_, crate::error::StoreError>((output, input, correct))
        };
        match loaded.await {
            Ok((output, input, correct)) => self.checker.run_checker(&output, &input, &correct).await,
            Err(e) => {
                warn!(subtest_id = st.id, "Couldn't load checker data: {}", e);
                (verdict::internal_error(e), 0.0)
            }
        }
    }
}

/// Compilation (of the submission or its checker) failed: floor score,
/// every subtask at 0%
async fn fail_compile(shared: &Shared, sub: &Submission, problem: &Problem, message: String) -> Result<()> {
    info!(submission_id = sub.id, "Compile error");
    let store = &shared.submissions;
    let update = SubmissionUpdate {
        score: Some(problem.default_points),
        max_time_ms: Some(-1),
        max_memory_kb: Some(-1),
        compile_error: Some(true),
        compile_message: Some(message),
        ..Default::default()
    };
    store.update_submission(sub.id, update).await?;
    for subtask in store.submission_subtasks(sub.id).await? {
        store.update_submission_subtask(subtask.id, 0.0).await?;
    }
    Ok(())
}

async fn persist_score(shared: &Shared, submission_id: i64, problem: &Problem) -> Result<()> {
    let store = &shared.submissions;
    let tests = store.tests(problem.id).await?;
    let subtests = store.subtests(submission_id).await?;
    let subtasks = store.submission_subtasks(submission_id).await?;

    let scored = scoring::score(problem.default_points, &tests, &subtests, &subtasks);
    for (id, pct) in &scored.subtask_percentages {
        store.update_submission_subtask(*id, *pct).await?;
    }
    let update = SubmissionUpdate {
        score: Some(scored.score),
        max_time_ms: Some(scored.max_time_ms),
        max_memory_kb: Some(scored.max_memory_kb),
        ..Default::default()
    };
    store.update_submission(submission_id, update).await?;
    debug!(submission_id, score = scored.score, "Submission scored");
    Ok(())
}

/// Always runs after grading: no SubTest stays pending and the submission
/// ends `finished`
async fn finalize(shared: &Shared, submission_id: i64, failed: bool) {
    let store = &shared.submissions;

    match store.subtests(submission_id).await {
        Ok(subtests) => {
            for st in subtests.into_iter().filter(|st| !st.done) {
                let mut update = SubTestUpdate {
                    done: Some(true),
                    ..Default::default()
                };
                if failed {
                    update.verdict = Some(verdict::INTERNAL_ERROR.to_string());
                    update.percentage = Some(0.0);
                }
                if let Err(e) = store.update_subtest(st.id, update).await {
                    warn!(subtest_id = st.id, "Couldn't finalize SubTest: {}", e);
                }
            }
        }
        Err(e) => warn!(submission_id, "Couldn't list SubTests to finalize: {}", e),
    }

    if failed {
        let rescored = async {
            let sub = store.submission(submission_id).await?;
            let problem = store.problem(sub.problem_id).await?;
            persist_score(shared, submission_id, &problem).await
        };
        if let Err(e) = rescored.await {
            warn!(submission_id, "Couldn't score failed submission: {}", e);
        }
    }

    for artifact in [submission_id, -submission_id] {
        if let Err(e) = shared.boxes.clean(artifact).await {
            warn!(submission_id, "Couldn't clean artifact {}: {}", artifact, e);
        }
    }

    let update = SubmissionUpdate::status(SubmissionStatus::Finished);
    if let Err(e) = store.update_submission(submission_id, update).await {
        error!(submission_id, "Couldn't mark submission finished: {}", e);
    }

    match store.submission(submission_id).await {
        Ok(sub) => {
            let _ = shared.finished.send(sub);
        }
        Err(e) => warn!(submission_id, "Couldn't reload finished submission: {}", e),
    }
}
