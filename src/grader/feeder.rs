//! Feeder loop
//!
//! Wakes on a timer tick or an explicit wake, pulls the oldest waiting
//! submissions and a few re-evaluations, and hands each one to its own
//! driver task. A batch that came back full means more work is queued, so
//! the feeder wakes itself instead of waiting for the next tick.
//!
//! On shutdown the box manager is cancelled, so in-flight submissions stop
//! at their next sandbox acquisition (or have their running program killed)
//! and finalize with internal errors.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{submission, Grader};
use crate::error::Result;
use crate::store::{Submission, SubmissionFilter, SubmissionStatus, SubmissionUpdate};

pub(super) async fn run(
    grader: &Grader,
    wake_rx: &mut mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(grader.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut drivers = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
            Some(()) = wake_rx.recv() => {}
            Some(joined) = drivers.join_next(), if !drivers.is_empty() => {
                if let Err(e) = joined {
                    error!("Submission driver failed: {}", e);
                }
                continue;
            }
        }

        match cycle(grader, &mut drivers).await {
            Ok(true) => grader.waker.wake(),
            Ok(false) => {}
            Err(e) => warn!("Feeder cycle failed: {}", e),
        }
    }

    // Queued and running sandbox work is abandoned; each driver's finalizer
    // still leaves its submission finished
    grader.shared.boxes.cancel();
    if !drivers.is_empty() {
        info!(in_flight = drivers.len(), "Cancelling in-flight submissions");
    }
    while let Some(joined) = drivers.join_next().await {
        if let Err(e) = joined {
            error!("Submission driver failed: {}", e);
        }
    }
}

/// One feeder pass. Returns whether either batch hit its cap.
async fn cycle(grader: &Grader, drivers: &mut JoinSet<()>) -> Result<bool> {
    let store = &grader.shared.submissions;

    let waiting = store
        .submissions(&SubmissionFilter::oldest(SubmissionStatus::Waiting, grader.waiting_batch))
        .await?;
    let waiting_full = waiting.len() >= grader.waiting_batch;
    if !waiting.is_empty() {
        info!(count = waiting.len(), "Found waiting submissions");
    }
    for sub in waiting {
        dispatch(grader, drivers, sub).await;
    }

    let reevals = store
        .submissions(&SubmissionFilter::oldest(
            SubmissionStatus::Reevaluating,
            grader.reeval_batch,
        ))
        .await?;
    let reeval_full = reevals.len() >= grader.reeval_batch;
    for sub in reevals {
        if let Err(e) = store.reset_submission(sub.id).await {
            warn!(submission_id = sub.id, "Couldn't reset submission: {}", e);
            continue;
        }
        debug!(submission_id = sub.id, "Re-evaluating submission");
        match store.submission(sub.id).await {
            Ok(fresh) => dispatch(grader, drivers, fresh).await,
            Err(e) => warn!(submission_id = sub.id, "Couldn't reload submission: {}", e),
        }
    }

    Ok(waiting_full || reeval_full)
}

/// Mark `sub` working and start its driver
async fn dispatch(grader: &Grader, drivers: &mut JoinSet<()>, mut sub: Submission) {
    let update = SubmissionUpdate::status(SubmissionStatus::Working);
    if let Err(e) = grader.shared.submissions.update_submission(sub.id, update).await {
        warn!(submission_id = sub.id, "Couldn't mark submission working: {}", e);
        return;
    }
    sub.status = SubmissionStatus::Working;
    drivers.spawn(submission::drive(Arc::clone(&grader.shared), sub));
}
