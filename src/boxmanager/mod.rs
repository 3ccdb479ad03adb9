//! BoxManager - sandbox pool with admission control
//!
//! This module provides:
//! - `Task`: a unit of work run inside exactly one sandbox
//! - `BoxManager::run_task`: acquire a slot, lend a sandbox, always give it back
//! - `BoxManager::sub_runner`: a nested manager with a lower ceiling that
//!   still counts against every ancestor's limit
//!
//! Slots are tokio semaphore permits. A manager holds a chain of limiters,
//! innermost first, ending at the process-wide one; a task holds one permit
//! from each for as long as its sandbox is alive.
//!
//! `cancel` is the top-level stop: waiting acquisitions give up and running
//! tasks are dropped, which kills their sandboxed process.
//!
//! The box manager does NOT:
//! - Know what a task does with the sandbox
//! - Retry failed tasks

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{GraderError, Result};
use crate::sandbox::{Sandbox, SandboxFactory};
use crate::store::ArtifactStore;

/// A unit of work executed inside one acquired sandbox
#[async_trait]
pub trait Task: Send {
    async fn execute(&mut self, sandbox: &dyn Sandbox) -> Result<()>;
}

struct Pool {
    factory: Arc<dyn SandboxFactory>,
    ids: Mutex<VecDeque<u32>>,
    artifacts: ArtifactStore,
    cancel: watch::Sender<bool>,
}

impl Pool {
    fn take_id(&self) -> Result<u32> {
        self.ids
            .lock()
            .map_err(|_| GraderError::Internal("box id pool lock poisoned".into()))?
            .pop_front()
            .ok_or_else(|| GraderError::Internal("box id pool exhausted".into()))
    }

    fn return_id(&self, id: u32) {
        match self.ids.lock() {
            Ok(mut ids) => ids.push_back(id),
            Err(_) => warn!(box_id = id, "Box id pool lock poisoned, dropping id"),
        }
    }
}

/// Pool of sandboxes gated by nested admission limiters
#[derive(Clone)]
pub struct BoxManager {
    pool: Arc<Pool>,
    /// Own limiter first, process-wide limiter last
    limiters: Vec<Arc<Semaphore>>,
    capacity: u32,
}

impl BoxManager {
    /// Create the root manager allowing `concurrency` sandboxes at once.
    ///
    /// Box ids `box_id_base .. box_id_base + 2 * concurrency` are recycled so a
    /// box that is still being torn down never blocks a new acquisition.
    pub fn new(
        factory: Arc<dyn SandboxFactory>,
        artifacts: ArtifactStore,
        concurrency: u32,
        box_id_base: u32,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let ids = (box_id_base..box_id_base + 2 * concurrency).collect();
        Self {
            pool: Arc::new(Pool {
                factory,
                ids: Mutex::new(ids),
                artifacts,
                cancel: watch::channel(false).0,
            }),
            limiters: vec![Arc::new(Semaphore::new(concurrency as usize))],
            capacity: concurrency,
        }
    }

    /// Maximum number of sandboxes this manager lends out at once
    pub fn num_concurrent(&self) -> u32 {
        self.capacity
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.pool.artifacts
    }

    /// Derive a manager capped at `k` concurrent tasks that shares this
    /// manager's accounting. `k` is clamped to `1..=num_concurrent()`.
    pub fn sub_runner(&self, k: u32) -> Result<BoxManager> {
        if self.limiters.iter().any(|l| l.is_closed()) {
            return Err(GraderError::Closed);
        }
        let k = k.clamp(1, self.capacity);
        let mut limiters = Vec::with_capacity(self.limiters.len() + 1);
        limiters.push(Arc::new(Semaphore::new(k as usize)));
        limiters.extend(self.limiters.iter().cloned());
        Ok(BoxManager {
            pool: self.pool.clone(),
            limiters,
            capacity: k,
        })
    }

    /// Run `task` inside a freshly acquired sandbox.
    ///
    /// The sandbox is closed, its id returned and its permits released on
    /// every path, including when this future is dropped mid-flight.
    pub async fn run_task<T: Task + ?Sized>(&self, task: &mut T) -> Result<()> {
        let cancel = self.pool.cancel.subscribe();
        let permits = tokio::select! {
            biased;
            _ = cancelled(cancel.clone()) => return Err(GraderError::Closed),
            permits = self.acquire() => permits?,
        };

        let box_id = self.pool.take_id()?;
        let mut lease = BoxLease {
            pool: self.pool.clone(),
            box_id,
            sandbox: None,
            permits,
        };

        let sandbox = self.pool.factory.create(box_id).await?;
        debug!(box_id, "Acquired sandbox");
        let sandbox = lease.sandbox.insert(sandbox);

        let result = tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                warn!(box_id, "Task cancelled, killing sandboxed process");
                Err(GraderError::Closed)
            }
            result = task.execute(sandbox.as_ref()) => result,
        };
        lease.release().await;
        result
    }

    /// One permit from every limiter, innermost first
    async fn acquire(&self) -> Result<Vec<OwnedSemaphorePermit>> {
        let mut permits = Vec::with_capacity(self.limiters.len());
        for limiter in &self.limiters {
            let permit = limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| GraderError::Closed)?;
            permits.push(permit);
        }
        Ok(permits)
    }

    /// Stop every manager sharing this pool: pending and future acquisitions
    /// fail with `Closed` and running tasks are dropped. Cannot be undone.
    pub fn cancel(&self) {
        self.pool.cancel.send_replace(true);
    }

    /// Remove the compile artifact stored under `id`
    pub async fn clean(&self, id: i64) -> Result<bool> {
        Ok(self.pool.artifacts.remove(id).await?)
    }

    /// Wait for every sandbox lent by this manager to come back, then refuse
    /// new work
    pub async fn close(&self) {
        let own = &self.limiters[0];
        match own.acquire_many(self.capacity).await {
            Ok(permits) => {
                own.close();
                drop(permits);
            }
            Err(_) => debug!("Box manager already closed"),
        }
    }
}

/// Resolves once the pool is cancelled
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// A borrowed sandbox plus the resources that must be returned with it
struct BoxLease {
    pool: Arc<Pool>,
    box_id: u32,
    sandbox: Option<Box<dyn Sandbox>>,
    permits: Vec<OwnedSemaphorePermit>,
}

impl BoxLease {
    async fn release(mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            if let Err(e) = sandbox.close().await {
                warn!(box_id = self.box_id, "Failed to close sandbox: {}", e);
            }
        }
        // Drop returns the id and the permits
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            self.pool.return_id(self.box_id);
            return;
        };

        // Abandoned mid-task (cancelled or panicked): close in the background
        // and keep the permits until the box is really gone.
        let pool = self.pool.clone();
        let box_id = self.box_id;
        let permits = std::mem::take(&mut self.permits);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(box_id, "Task abandoned its sandbox, closing in background");
                handle.spawn(async move {
                    if let Err(e) = sandbox.close().await {
                        warn!(box_id, "Failed to close abandoned sandbox: {}", e);
                    }
                    pool.return_id(box_id);
                    drop(permits);
                });
            }
            Err(_) => {
                warn!(box_id, "No runtime to close abandoned sandbox");
                pool.return_id(box_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::FakeFactory;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct Hold {
        duration: Duration,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task for Hold {
        async fn execute(&mut self, sandbox: &dyn Sandbox) -> Result<()> {
            sandbox.write_file("/box/marker", b"x", 0o644).await?;
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl Task for Fail {
        async fn execute(&mut self, _sandbox: &dyn Sandbox) -> Result<()> {
            Err(GraderError::Internal("task failed".into()))
        }
    }

    struct Explode;

    #[async_trait]
    impl Task for Explode {
        async fn execute(&mut self, _sandbox: &dyn Sandbox) -> Result<()> {
            panic!("task exploded");
        }
    }

    async fn manager(factory: Arc<FakeFactory>, n: u32) -> (BoxManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path()).await.unwrap();
        (BoxManager::new(factory, artifacts, n, 100), dir)
    }

    fn hold(ms: u64, running: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Hold {
        Hold {
            duration: Duration::from_millis(ms),
            running: running.clone(),
            peak: peak.clone(),
        }
    }

    #[tokio::test]
    async fn test_never_more_than_n_sandboxes_in_use() {
        let factory = Arc::new(FakeFactory::new());
        let (mgr, _dir) = manager(factory.clone(), 3).await;
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let mgr = mgr.clone();
            let mut task = hold(15, &running, &peak);
            handles.push(tokio::spawn(async move { mgr.run_task(&mut task).await }));
        }
        for h in handles {
            tokio_test::assert_ok!(h.await.unwrap());
        }

        assert!(factory.tracker.peak() <= 3, "peak was {}", factory.tracker.peak());
        assert_eq!(factory.tracker.peak(), 3);
        assert_eq!(factory.tracker.created(), 20);
        assert_eq!(factory.tracker.closed(), 20);
        assert_eq!(factory.tracker.in_use(), 0);

        let ids = factory.ids.lock().unwrap().clone();
        assert!(ids.iter().all(|id| (100..106).contains(id)));
    }

    #[tokio::test]
    async fn test_sub_runners_share_global_limit() {
        let factory = Arc::new(FakeFactory::new());
        let (mgr, _dir) = manager(factory.clone(), 3).await;
        let peak_a = Arc::new(AtomicUsize::new(0));
        let peak_b = Arc::new(AtomicUsize::new(0));
        let running_a = Arc::new(AtomicUsize::new(0));
        let running_b = Arc::new(AtomicUsize::new(0));

        let a = mgr.sub_runner(2).unwrap();
        let b = mgr.sub_runner(1).unwrap();
        assert_eq!(a.num_concurrent(), 2);
        assert_eq!(mgr.sub_runner(50).unwrap().num_concurrent(), 3);

        let mut handles = Vec::new();
        for i in 0..12 {
            let (runner, mut task) = if i % 2 == 0 {
                (a.clone(), hold(10, &running_a, &peak_a))
            } else {
                (b.clone(), hold(10, &running_b, &peak_b))
            };
            handles.push(tokio::spawn(async move { runner.run_task(&mut task).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(peak_a.load(Ordering::SeqCst) <= 2);
        assert_eq!(peak_b.load(Ordering::SeqCst), 1);
        assert!(factory.tracker.peak() <= 3);
    }

    #[tokio::test]
    async fn test_release_on_error_and_panic() {
        let factory = Arc::new(FakeFactory::new());
        let (mgr, _dir) = manager(factory.clone(), 1).await;

        tokio_test::assert_err!(mgr.run_task(&mut Fail).await);
        assert_eq!(factory.tracker.in_use(), 0);

        let panicking = mgr.clone();
        let joined = tokio::spawn(async move { panicking.run_task(&mut Explode).await }).await;
        assert!(joined.unwrap_err().is_panic());

        // The single slot comes back once the background close has run
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut task = hold(1, &running, &peak);
        tokio::time::timeout(Duration::from_secs(2), mgr.run_task(&mut task))
            .await
            .expect("slot leaked after panic")
            .unwrap();
        assert_eq!(factory.tracker.in_use(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_task_releases_slot() {
        let factory = Arc::new(FakeFactory::new());
        let (mgr, _dir) = manager(factory.clone(), 1).await;
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut slow = hold(5_000, &running, &peak);
        let cancelled = tokio::time::timeout(Duration::from_millis(20), mgr.run_task(&mut slow)).await;
        assert!(cancelled.is_err());

        let mut quick = hold(1, &running, &peak);
        tokio::time::timeout(Duration::from_secs(2), mgr.run_task(&mut quick))
            .await
            .expect("slot leaked after cancellation")
            .unwrap();
        assert_eq!(factory.tracker.created(), factory.tracker.closed());
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_and_running_tasks() {
        let factory = Arc::new(FakeFactory::new());
        let (mgr, _dir) = manager(factory.clone(), 1).await;
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mgr = mgr.clone();
            let mut task = hold(5_000, &running, &peak);
            handles.push(tokio::spawn(async move { mgr.run_task(&mut task).await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(factory.tracker.in_use(), 1);

        let started = std::time::Instant::now();
        mgr.sub_runner(1).unwrap().cancel();
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(err, GraderError::Closed));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(factory.tracker.created(), 1);

        mgr.close().await;
        assert_eq!(factory.tracker.in_use(), 0);
        let err = mgr.run_task(&mut hold(1, &running, &peak)).await.unwrap_err();
        assert!(matches!(err, GraderError::Closed));
    }

    #[tokio::test]
    async fn test_factory_failure_is_an_error_and_frees_slot() {
        let factory = Arc::new(FakeFactory::new());
        factory.fail_create.store(true, Ordering::SeqCst);
        let (mgr, _dir) = manager(factory.clone(), 1).await;
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let err = mgr.run_task(&mut hold(1, &running, &peak)).await.unwrap_err();
        assert!(matches!(err, GraderError::Sandbox(crate::error::SandboxError::Permission(_))));

        factory.fail_create.store(false, Ordering::SeqCst);
        mgr.run_task(&mut hold(1, &running, &peak)).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_waits_for_outstanding_sandboxes() {
        let factory = Arc::new(FakeFactory::new());
        let (mgr, _dir) = manager(factory.clone(), 2).await;
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let worker = {
            let mgr = mgr.clone();
            let mut task = hold(50, &running, &peak);
            let finished = finished.clone();
            tokio::spawn(async move {
                mgr.run_task(&mut task).await.unwrap();
                finished.store(true, Ordering::SeqCst);
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        mgr.close().await;
        assert_eq!(factory.tracker.in_use(), 0);
        worker.await.unwrap();
        assert!(finished.load(Ordering::SeqCst));

        let err = mgr.run_task(&mut hold(1, &running, &peak)).await.unwrap_err();
        assert!(matches!(err, GraderError::Closed));
        assert!(matches!(mgr.sub_runner(1), Err(GraderError::Closed)));
    }

    #[tokio::test]
    async fn test_clean_removes_artifact() {
        let factory = Arc::new(FakeFactory::new());
        let (mgr, _dir) = manager(factory, 1).await;

        mgr.artifacts().save(5, b"bin").await.unwrap();
        assert!(mgr.clean(5).await.unwrap());
        assert!(!mgr.clean(5).await.unwrap());
    }
}
