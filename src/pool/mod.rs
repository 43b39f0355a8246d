pub mod docker;
pub mod scratch;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::error::{EngineError, EngineResult};
use docker::{ContainerDriver, ContainerId, ExecOutput};
use scratch::ScratchDir;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    fn mint() -> Self {
        Self(format!("cell-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sandbox worker: one long-lived container bound to one scratch
/// directory for its whole life. Replacement always produces a fresh
/// pair.
#[derive(Debug)]
pub struct SandboxWorker {
    pub id: WorkerId,
    pub container: ContainerId,
    pub scratch: ScratchDir,
}

/// Exclusive hold on a worker, issued by [`SandboxPool::acquire`] and
/// returned through `release` (or `replace`). Consuming the lease is
/// what makes double-release unrepresentable.
#[derive(Debug)]
pub struct Lease {
    worker: SandboxWorker,
}

impl Lease {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker.id
    }

    pub fn scratch_path(&self) -> &Path {
        self.worker.scratch.path()
    }
}

/// Fixed-size pool of sandbox workers behind a bounded hand-off queue.
///
/// The queue capacity equals the worker count, so `acquire` naturally
/// backpressures once every worker is leased. Membership (idle vs
/// active) is guarded by one critical section; a worker is in the idle
/// queue or the active map, never both.
pub struct SandboxPool {
    driver: Arc<dyn ContainerDriver>,
    tmpfs_root: PathBuf,
    size: usize,
    idle_tx: mpsc::Sender<SandboxWorker>,
    idle_rx: Mutex<mpsc::Receiver<SandboxWorker>>,
    active: Mutex<HashMap<WorkerId, (ContainerId, PathBuf)>>,
}

impl SandboxPool {
    /// Create `size` workers up front. If any creation fails, the ones
    /// already created are torn down and the error propagates: a
    /// partially sized pool would silently change the backpressure
    /// contract.
    pub async fn new(
        driver: Arc<dyn ContainerDriver>,
        size: usize,
        tmpfs_root: PathBuf,
    ) -> EngineResult<Self> {
        let size = size.max(1);
        let (idle_tx, idle_rx) = mpsc::channel(size);
        let pool = Self {
            driver,
            tmpfs_root,
            size,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            active: Mutex::new(HashMap::new()),
        };

        let mut created = Vec::with_capacity(size);
        for _ in 0..size {
            match pool.create_worker().await {
                Ok(worker) => created.push(worker),
                Err(e) => {
                    for worker in created {
                        pool.destroy_worker(worker).await;
                    }
                    return Err(e);
                }
            }
        }
        for worker in created {
            tracing::info!(worker = %worker.id, container = %worker.container, "sandbox worker ready");
            // Capacity equals `size`, so this cannot be full.
            let _ = pool.idle_tx.try_send(worker);
        }
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Wait up to `timeout` for an idle worker. Waiters queue on the
    /// hand-off channel; exceeding the deadline is `PoolExhausted`.
    pub async fn acquire(&self, timeout: Duration) -> EngineResult<Lease> {
        let worker = tokio::time::timeout(timeout, async {
            let mut rx = self.idle_rx.lock().await;
            rx.recv().await
        })
        .await
        .map_err(|_| EngineError::PoolExhausted(timeout.as_secs()))?
        .ok_or_else(|| {
            EngineError::ServiceUnavailable("sandbox pool is shut down".to_string())
        })?;

        self.active.lock().await.insert(
            worker.id.clone(),
            (worker.container.clone(), worker.scratch.path().to_path_buf()),
        );
        tracing::debug!(worker = %worker.id, "sandbox worker acquired");
        Ok(Lease { worker })
    }

    /// Run `command` inside the leased worker, working directory at the
    /// scratch bind point.
    pub async fn exec(&self, lease: &Lease, command: &[&str]) -> EngineResult<ExecOutput> {
        self.driver.exec(&lease.worker.container, command).await
    }

    /// Empty the scratch directory and return the worker to the idle
    /// queue. A failed cleanup condemns the worker: it is destroyed and
    /// a fresh (container, scratch) pair takes its place.
    pub async fn release(&self, lease: Lease) {
        let worker = lease.worker;
        match worker.scratch.clear() {
            Ok(()) => {
                self.active.lock().await.remove(&worker.id);
                tracing::debug!(worker = %worker.id, "sandbox worker released");
                if let Err(e) = self.idle_tx.try_send(worker) {
                    // Only possible after shutdown closed the receiver.
                    let worker = match e {
                        mpsc::error::TrySendError::Full(w)
                        | mpsc::error::TrySendError::Closed(w) => w,
                    };
                    self.destroy_worker(worker).await;
                }
            }
            Err(e) => {
                tracing::error!(worker = %worker.id, error = %e, "scratch cleanup failed, replacing worker");
                self.replace_worker(worker).await;
            }
        }
    }

    /// Destroy the leased worker outright and enqueue a replacement.
    /// For callers that cannot trust the worker any more, e.g. after an
    /// externally imposed execution deadline.
    pub async fn replace(&self, lease: Lease) {
        self.replace_worker(lease.worker).await;
    }

    /// Drain the idle queue and force-remove every active worker,
    /// deleting all scratch directories.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down sandbox pool");
        {
            let mut rx = self.idle_rx.lock().await;
            rx.close();
            while let Ok(worker) = rx.try_recv() {
                self.destroy_worker(worker).await;
            }
        }

        let active: Vec<(WorkerId, (ContainerId, PathBuf))> =
            self.active.lock().await.drain().collect();
        for (id, (container, scratch_path)) in active {
            tracing::info!(worker = %id, "removing active sandbox worker");
            if let Err(e) = self.driver.remove(&container).await {
                tracing::warn!(worker = %id, error = %e, "failed to remove container");
            }
            if let Err(e) = std::fs::remove_dir_all(&scratch_path) {
                tracing::warn!(worker = %id, error = %e, "failed to remove scratch dir");
            }
        }
    }

    async fn create_worker(&self) -> EngineResult<SandboxWorker> {
        let scratch = ScratchDir::create(&self.tmpfs_root)
            .map_err(|e| EngineError::SandboxTransient(format!("scratch create failed: {e}")))?;
        match self.driver.create(scratch.path()).await {
            Ok(container) => Ok(SandboxWorker {
                id: WorkerId::mint(),
                container,
                scratch,
            }),
            Err(e) => {
                scratch.destroy();
                Err(e)
            }
        }
    }

    async fn destroy_worker(&self, worker: SandboxWorker) {
        if let Err(e) = self.driver.remove(&worker.container).await {
            tracing::warn!(worker = %worker.id, error = %e, "failed to remove container");
        }
        worker.scratch.destroy();
    }

    async fn replace_worker(&self, worker: SandboxWorker) {
        self.active.lock().await.remove(&worker.id);
        self.destroy_worker(worker).await;

        match self.create_worker().await {
            Ok(fresh) => {
                tracing::info!(worker = %fresh.id, "replacement sandbox worker ready");
                let _ = self.idle_tx.try_send(fresh);
            }
            Err(e) => {
                // The pool shrinks until the next successful replace;
                // acquisitions beyond the remaining capacity time out
                // as PoolExhausted.
                tracing::error!(error = %e, "failed to create replacement worker");
            }
        }
    }
}
