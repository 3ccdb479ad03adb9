//! Grader - drives queued submissions to completion
//!
//! This module provides:
//! - `Grader`: the service object owning the box manager, stores and
//!   language registry
//! - `Waker`: a cheap handle that asks the feeder to look for work now
//! - the feeder loop (`feeder`) and the per-submission driver (`submission`)
//!
//! Several graders can live in one process; nothing here is global.

mod feeder;
mod submission;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::info;

use crate::boxmanager::BoxManager;
use crate::config::GraderConfig;
use crate::error::{GraderError, Result};
use crate::languages::Languages;
use crate::store::{DataStore, Submission, SubmissionStore};

/// Collaborators a grader is built from
#[derive(Clone)]
pub struct GraderDeps {
    pub submissions: Arc<dyn SubmissionStore>,
    pub data: Arc<dyn DataStore>,
    pub languages: Arc<Languages>,
    pub boxes: BoxManager,
}

/// State shared with every submission driver
pub(crate) struct Shared {
    pub(crate) submissions: Arc<dyn SubmissionStore>,
    pub(crate) data: Arc<dyn DataStore>,
    pub(crate) languages: Arc<Languages>,
    pub(crate) boxes: BoxManager,
    finished: broadcast::Sender<Submission>,
}

/// Coalescing wake signal for the feeder
#[derive(Clone)]
pub struct Waker {
    tx: mpsc::Sender<()>,
}

impl Waker {
    /// Never blocks; wakes queued while one is pending are merged
    pub fn wake(&self) {
        let _ = self.tx.try_send(());
    }
}

pub struct Grader {
    shared: Arc<Shared>,
    waiting_batch: usize,
    reeval_batch: usize,
    tick: Duration,
    waker: Waker,
    wake_rx: Mutex<mpsc::Receiver<()>>,
}

impl Grader {
    pub fn new(config: &GraderConfig, deps: GraderDeps) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (finished, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                submissions: deps.submissions,
                data: deps.data,
                languages: deps.languages,
                boxes: deps.boxes,
                finished,
            }),
            waiting_batch: config.waiting_batch.max(1),
            reeval_batch: config.reeval_batch.max(1),
            tick: config.tick,
            waker: Waker { tx },
            wake_rx: Mutex::new(rx),
        }
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Every submission that reaches `finished`, as persisted at that moment
    pub fn subscribe(&self) -> broadcast::Receiver<Submission> {
        self.shared.finished.subscribe()
    }

    pub fn boxes(&self) -> &BoxManager {
        &self.shared.boxes
    }

    /// Run the feeder until `shutdown` becomes true (or its sender is
    /// dropped), then cancel the box manager, wait for every submission
    /// driver to finalize and drain the box manager.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut wake_rx = self
            .wake_rx
            .try_lock()
            .map_err(|_| GraderError::Internal("grader is already running".into()))?;

        info!(
            concurrency = self.shared.boxes.num_concurrent(),
            "Grader started"
        );
        feeder::run(self, &mut wake_rx, shutdown).await;

        self.shared.boxes.close().await;
        info!("Grader stopped");
        Ok(())
    }
}
