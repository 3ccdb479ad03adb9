//! Scoring engine
//!
//! Pure functions over persisted per-test results, so re-running them on the
//! same rows always yields the same score.
//!
//! - Flat: `floor + Σ round(test.score × pct / 100)`
//! - Subtasks: each subtask takes the minimum percentage of its members
//!   (an empty subtask scores 0) and contributes
//!   `round(subtask.score × pct / 100)`

use std::collections::HashMap;

use crate::store::{SubTest, SubmissionSubTask, Test};

/// Final numbers for one submission
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub score: i64,
    /// (SubmissionSubTask id, percentage)
    pub subtask_percentages: Vec<(i64, f64)>,
    /// -1 when no SubTest ran
    pub max_time_ms: i64,
    pub max_memory_kb: i64,
}

pub fn clamp_percentage(pct: f64) -> f64 {
    if pct.is_nan() {
        0.0
    } else {
        pct.clamp(0.0, 100.0)
    }
}

fn weighted(weight: i64, pct: f64) -> i64 {
    (weight as f64 * clamp_percentage(pct) / 100.0).round() as i64
}

/// Percentage of a subtask: the minimum over its members, 0 when it has none
pub fn subtask_percentage(members: &[f64]) -> f64 {
    members
        .iter()
        .copied()
        .map(clamp_percentage)
        .reduce(f64::min)
        .unwrap_or(0.0)
}

/// Score without subtasks; SubTests whose test no longer exists count 0
pub fn flat_score(floor: i64, tests: &[Test], subtests: &[SubTest]) -> i64 {
    let weights: HashMap<i64, i64> = tests.iter().map(|t| (t.id, t.score)).collect();
    floor
        + subtests
            .iter()
            .filter_map(|st| weights.get(&st.test_id).map(|w| weighted(*w, st.percentage)))
            .sum::<i64>()
}

/// Per-subtask percentages and the resulting score
pub fn subtask_score(
    floor: i64,
    subtasks: &[SubmissionSubTask],
    subtests: &[SubTest],
) -> (i64, Vec<(i64, f64)>) {
    let by_id: HashMap<i64, f64> = subtests.iter().map(|st| (st.id, st.percentage)).collect();
    let mut total = floor;
    let mut percentages = Vec::with_capacity(subtasks.len());
    for subtask in subtasks {
        let members: Vec<f64> = subtask
            .subtests
            .iter()
            .filter_map(|id| by_id.get(id).copied())
            .collect();
        let pct = subtask_percentage(&members);
        total += weighted(subtask.score, pct);
        percentages.push((subtask.id, pct));
    }
    (total, percentages)
}

/// Score a submission from its persisted rows
pub fn score(
    floor: i64,
    tests: &[Test],
    subtests: &[SubTest],
    subtasks: &[SubmissionSubTask],
) -> Scored {
    let (score, subtask_percentages) = if subtasks.is_empty() {
        (flat_score(floor, tests, subtests), Vec::new())
    } else {
        subtask_score(floor, subtasks, subtests)
    };

    let ran = subtests.iter().filter(|st| st.done);
    let (max_time_ms, max_memory_kb) = ran.fold((-1, -1), |(t, m), st| {
        (t.max(st.time_ms as i64), m.max(st.memory_kb as i64))
    });

    Scored {
        score,
        subtask_percentages,
        max_time_ms,
        max_memory_kb,
    }
}
