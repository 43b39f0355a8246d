use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::data::cache::{BlobStore, MarketDataCache};
use crate::data::fetch::HttpOrigin;
use crate::data::DateRange;
use crate::error::{EngineError, EngineResult};
use crate::pool::docker::{DockerCli, ExecOutput};
use crate::pool::{scratch, SandboxPool};
use crate::store::{Store, TaskResult};

/// Command run inside the sandbox worker; the scratch bind point is the
/// working directory.
const SANDBOX_COMMAND: &[&str] = &["/app/execute"];

/// Transient container-API failures retry this many times, this far
/// apart. Nothing else retries.
const MAX_EXEC_RETRIES: u32 = 3;
const EXEC_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How long a worker blocks on the queue before refreshing its
/// heartbeat and looking again.
const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(5);

const BROKER_CONNECT_ATTEMPTS: u32 = 5;

/// One backtest submission, immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub symbol: String,
    pub code: String,
    pub params: HashMap<String, f64>,
    pub range: DateRange,
}

/// What travels over the execution queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub task_id: String,
    pub request: BacktestRequest,
}

/// Submission path: fail fast when the backend cannot possibly deliver
/// a result, then enqueue and hand the task id back. Everything after
/// the 202 is the job worker's problem.
pub async fn submit(
    broker: &Store,
    results: &Store,
    request: BacktestRequest,
) -> EngineResult<String> {
    if !results.ping().await {
        return Err(EngineError::ServiceUnavailable(
            "result store unreachable".to_string(),
        ));
    }
    if !broker.workers_alive().await {
        return Err(EngineError::ServiceUnavailable(
            "no job workers consuming the execution queue".to_string(),
        ));
    }

    let task_id = uuid::Uuid::new_v4().to_string();
    let envelope = JobEnvelope {
        task_id: task_id.clone(),
        request,
    };
    let payload = serde_json::to_string(&envelope)
        .map_err(|e| EngineError::ServiceUnavailable(format!("envelope encode: {e}")))?;
    broker
        .enqueue(&payload)
        .await
        .map_err(|e| EngineError::ServiceUnavailable(format!("enqueue failed: {e:#}")))?;

    tracing::info!(%task_id, symbol = %envelope.request.symbol, "backtest task queued");
    Ok(task_id)
}

/// One queue consumer. Several run per worker process, all sharing the
/// process-wide pool, cache and store.
pub struct JobWorker {
    name: String,
    broker: Arc<Store>,
    results: Arc<Store>,
    cache: Arc<MarketDataCache>,
    pool: Arc<SandboxPool>,
    acquire_timeout: Duration,
}

impl JobWorker {
    pub fn new(
        name: String,
        broker: Arc<Store>,
        results: Arc<Store>,
        cache: Arc<MarketDataCache>,
        pool: Arc<SandboxPool>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            name,
            broker,
            results,
            cache,
            pool,
            acquire_timeout,
        }
    }

    /// Drain the queue forever. User-code faults and backend hiccups
    /// are published or logged; they never take the worker down.
    pub async fn run(&self) {
        tracing::info!(worker = %self.name, "job worker started");
        loop {
            if let Err(e) = self.broker.heartbeat().await {
                tracing::warn!(worker = %self.name, error = %e, "heartbeat failed");
            }

            let payload = match self.broker.next_job(&self.name, QUEUE_POLL_TIMEOUT).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(worker = %self.name, error = %e, "queue poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            self.handle(&payload).await;

            if let Err(e) = self.broker.ack_job(&self.name, &payload).await {
                tracing::warn!(worker = %self.name, error = %e, "job ack failed");
            }
        }
    }

    async fn handle(&self, payload: &str) {
        let envelope: JobEnvelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Poison payloads are acked away, not retried forever.
                tracing::error!(worker = %self.name, error = %e, "dropping malformed job payload");
                return;
            }
        };

        let task_id = envelope.task_id.clone();
        tracing::info!(worker = %self.name, %task_id, symbol = %envelope.request.symbol, "executing backtest");

        let outcome = self.execute_job(&envelope.request).await;
        let result = outcome_to_result(outcome);

        match self.results.publish_result(&task_id, &result).await {
            Ok(true) => tracing::info!(worker = %self.name, %task_id, "result published"),
            Ok(false) => {
                tracing::warn!(worker = %self.name, %task_id, "result already published, keeping first write");
            }
            Err(e) => tracing::error!(worker = %self.name, %task_id, error = %e, "result publish failed"),
        }
    }

    /// The six ordered steps of one execution. The lease is released on
    /// every path out once acquired.
    async fn execute_job(&self, request: &BacktestRequest) -> EngineResult<ExecOutput> {
        let frame = self.cache.get(&request.symbol).await?;
        let filtered = frame
            .filter(&request.range)
            .map_err(|e| EngineError::Validation(format!("bad date range: {e:#}")))?;

        let lease = self.pool.acquire(self.acquire_timeout).await?;

        let outcome = async {
            scratch::stage_inputs(lease.scratch_path(), &request.code, &filtered, &request.params)?;
            self.exec_with_retry(&lease).await
        }
        .await;

        self.pool.release(lease).await;
        outcome
    }

    async fn exec_with_retry(&self, lease: &crate::pool::Lease) -> EngineResult<ExecOutput> {
        let mut attempt = 0;
        loop {
            match self.pool.exec(lease, SANDBOX_COMMAND).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < MAX_EXEC_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        worker = %self.name,
                        attempt,
                        error = %e,
                        "transient sandbox error, retrying in {EXEC_RETRY_DELAY:?}"
                    );
                    tokio::time::sleep(EXEC_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Map an execution outcome onto the published record: a clean exit is
/// a completed result, anything else carries a diagnostic (and the
/// captured stderr when there is one).
fn outcome_to_result(outcome: EngineResult<ExecOutput>) -> TaskResult {
    match outcome {
        Ok(output) if output.exit_code == 0 => TaskResult::Completed {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        },
        Ok(output) => TaskResult::Error {
            error: format!("sandbox exited with code {}", output.exit_code),
            stderr: Some(output.stderr),
        },
        Err(e) => TaskResult::Error {
            error: e.to_string(),
            stderr: None,
        },
    }
}

/// Worker-process entry: connect to the backend (with startup backoff),
/// build the pool, and run one consumer per worker slot until
/// interrupted.
pub async fn run_worker(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(Store::connect_with_retry(&config.broker_url, BROKER_CONNECT_ATTEMPTS).await?);
    let results = if config.result_backend_url == config.broker_url {
        Arc::clone(&store)
    } else {
        Arc::new(Store::connect_with_retry(&config.result_backend_url, BROKER_CONNECT_ATTEMPTS).await?)
    };

    let origin = Arc::new(HttpOrigin::new(config.data_url.clone().unwrap_or_default()));
    let cache = Arc::new(MarketDataCache::new(
        Arc::clone(&results) as Arc<dyn BlobStore>,
        origin,
    ));

    let driver = Arc::new(DockerCli::new(
        config.sandbox_image.clone(),
        config.sandbox_network.clone(),
        config.host_tmpfs_bind.clone(),
    ));
    let pool = Arc::new(
        SandboxPool::new(driver, config.pool_size, PathBuf::from(&config.tmpfs_root)).await?,
    );

    let mut consumers = Vec::new();
    for slot in 0..config.pool_size {
        let worker = JobWorker::new(
            format!("worker-{slot}-{}", uuid::Uuid::new_v4().simple()),
            Arc::clone(&store),
            Arc::clone(&results),
            Arc::clone(&cache),
            Arc::clone(&pool),
            config.acquire_timeout,
        );
        consumers.push(tokio::spawn(async move { worker.run().await }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    for consumer in &consumers {
        consumer.abort();
    }
    pool.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> BacktestRequest {
        let mut params = HashMap::new();
        params.insert("initialCapital".to_string(), 10_000.0);
        BacktestRequest {
            symbol: "XYZ".to_string(),
            code: "fn generate_signals(frame) { frame }".to_string(),
            params,
            range: DateRange {
                from: "2020-01-02".to_string(),
                to: "2020-01-06".to_string(),
            },
        }
    }

    #[test]
    fn envelope_round_trips_as_json() {
        let envelope = JobEnvelope {
            task_id: "t-1".to_string(),
            request: sample_request(),
        };
        let payload = serde_json::to_string(&envelope).unwrap();
        let back: JobEnvelope = serde_json::from_str(&payload).unwrap();
        assert_eq!(back.task_id, "t-1");
        assert_eq!(back.request.symbol, "XYZ");
        assert_eq!(back.request.range.from, "2020-01-02");
    }

    #[test]
    fn clean_exit_publishes_completed() {
        let result = outcome_to_result(Ok(ExecOutput {
            exit_code: 0,
            stdout: "{\"finalCapital\":10027.0}".to_string(),
            stderr: "log line".to_string(),
        }));
        match result {
            TaskResult::Completed {
                exit_code, stdout, ..
            } => {
                assert_eq!(exit_code, 0);
                assert!(stdout.contains("finalCapital"));
            }
            TaskResult::Error { .. } => panic!("expected completed"),
        }
    }

    #[test]
    fn nonzero_exit_publishes_error_with_stderr() {
        let result = outcome_to_result(Ok(ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "access to '__class__' is prohibited".to_string(),
        }));
        match result {
            TaskResult::Error { error, stderr } => {
                assert!(error.contains("exited with code 1"));
                assert!(stderr.unwrap().contains("__class__"));
            }
            TaskResult::Completed { .. } => panic!("expected error"),
        }
    }

    #[test]
    fn pipeline_errors_publish_their_message() {
        let result = outcome_to_result(Err(EngineError::PoolExhausted(30)));
        match result {
            TaskResult::Error { error, stderr } => {
                assert!(error.contains("30 seconds"));
                assert!(stderr.is_none());
            }
            TaskResult::Completed { .. } => panic!("expected error"),
        }
    }
}
