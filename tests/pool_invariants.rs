//! Pool behaviour against an in-process container driver: conservation
//! of the worker set, scratch isolation between leases, backpressure
//! under contention, and replacement of condemned workers.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tradecell::error::{EngineError, EngineResult};
use tradecell::pool::docker::{ContainerDriver, ContainerId, ExecOutput};
use tradecell::pool::SandboxPool;

/// Driver that fabricates container ids and records lifecycle calls.
/// `exec` sleeps for `exec_delay` and tracks how many executions run at
/// once.
struct FakeDriver {
    created: AtomicUsize,
    removed: AtomicUsize,
    exec_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeDriver {
    fn new(exec_delay: Duration) -> Self {
        Self {
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            exec_delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn create(&self, _scratch: &Path) -> EngineResult<ContainerId> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ContainerId(format!("fake-container-{n}")))
    }

    async fn exec(&self, _id: &ContainerId, _command: &[&str]) -> EngineResult<ExecOutput> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.exec_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecOutput {
            exit_code: 0,
            stdout: "{}".to_string(),
            stderr: String::new(),
        })
    }

    async fn remove(&self, _id: &ContainerId) -> EngineResult<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn make_pool(
    size: usize,
    exec_delay: Duration,
) -> (Arc<SandboxPool>, Arc<FakeDriver>, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let driver = Arc::new(FakeDriver::new(exec_delay));
    let pool = SandboxPool::new(
        Arc::clone(&driver) as Arc<dyn ContainerDriver>,
        size,
        root.path().to_path_buf(),
    )
    .await
    .unwrap();
    (Arc::new(pool), driver, root)
}

#[tokio::test]
async fn pool_hands_out_exactly_its_size() {
    let (pool, driver, _root) = make_pool(2, Duration::ZERO).await;
    assert_eq!(driver.created.load(Ordering::SeqCst), 2);

    let a = pool.acquire(Duration::from_millis(200)).await.unwrap();
    let b = pool.acquire(Duration::from_millis(200)).await.unwrap();
    assert_ne!(a.worker_id(), b.worker_id());
    assert_eq!(pool.active_count().await, 2);

    // Both workers leased: the next acquire must time out.
    let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, EngineError::PoolExhausted(_)));

    pool.release(a).await;
    let c = pool.acquire(Duration::from_millis(200)).await.unwrap();
    pool.release(b).await;
    pool.release(c).await;
    assert_eq!(pool.active_count().await, 0);
}

#[tokio::test]
async fn released_worker_comes_back_with_an_empty_scratch() {
    let (pool, _driver, _root) = make_pool(1, Duration::ZERO).await;

    let lease = pool.acquire(Duration::from_millis(200)).await.unwrap();
    let first_id = lease.worker_id().clone();
    std::fs::write(lease.scratch_path().join("code.rhai"), "fn f() {}").unwrap();
    std::fs::create_dir(lease.scratch_path().join("junk")).unwrap();
    pool.release(lease).await;

    let lease = pool.acquire(Duration::from_millis(200)).await.unwrap();
    assert_eq!(lease.worker_id(), &first_id, "single worker must recycle");
    let leftovers: Vec<_> = std::fs::read_dir(lease.scratch_path())
        .unwrap()
        .collect();
    assert!(leftovers.is_empty(), "scratch not emptied: {leftovers:?}");
    pool.release(lease).await;
}

#[tokio::test]
async fn failed_cleanup_condemns_and_replaces_the_worker() {
    let (pool, driver, _root) = make_pool(1, Duration::ZERO).await;

    let lease = pool.acquire(Duration::from_millis(200)).await.unwrap();
    let condemned_id = lease.worker_id().clone();
    // Deleting the scratch directory makes the release-time cleanup
    // fail, which must condemn the worker.
    std::fs::remove_dir_all(lease.scratch_path()).unwrap();
    pool.release(lease).await;

    assert_eq!(driver.removed.load(Ordering::SeqCst), 1);
    assert_eq!(driver.created.load(Ordering::SeqCst), 2);

    // The replacement is a fresh pair with a usable scratch dir.
    let lease = pool.acquire(Duration::from_millis(200)).await.unwrap();
    assert_ne!(lease.worker_id(), &condemned_id);
    assert!(lease.scratch_path().exists());
    pool.release(lease).await;
}

#[tokio::test]
async fn explicit_replace_discards_the_leased_worker() {
    let (pool, driver, _root) = make_pool(1, Duration::ZERO).await;

    let lease = pool.acquire(Duration::from_millis(200)).await.unwrap();
    let old_id = lease.worker_id().clone();
    pool.replace(lease).await;

    assert_eq!(driver.removed.load(Ordering::SeqCst), 1);
    let lease = pool.acquire(Duration::from_millis(200)).await.unwrap();
    assert_ne!(lease.worker_id(), &old_id);
    pool.release(lease).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_jobs_share_two_workers_without_timeouts() {
    let (pool, driver, _root) = make_pool(2, Duration::from_millis(300)).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let lease = pool.acquire(Duration::from_secs(30)).await?;
            let output = pool.exec(&lease, &["/app/execute"]).await;
            pool.release(lease).await;
            output
        }));
    }

    for handle in handles {
        let output = handle.await.unwrap().unwrap();
        assert_eq!(output.exit_code, 0);
    }

    // The third job waited for a free worker instead of overcommitting.
    assert!(driver.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.active_count().await, 0);
}

#[tokio::test]
async fn shutdown_tears_down_idle_and_active_workers() {
    let (pool, driver, root) = make_pool(2, Duration::ZERO).await;

    // One leased, one idle.
    let _lease = pool.acquire(Duration::from_millis(200)).await.unwrap();
    pool.shutdown().await;

    assert_eq!(driver.removed.load(Ordering::SeqCst), 2);
    let leftovers: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "scratch dirs left behind: {leftovers:?}");

    // The pool refuses new leases after shutdown.
    let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::ServiceUnavailable(_) | EngineError::PoolExhausted(_)
    ));
}
