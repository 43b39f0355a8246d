use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::data::cache::BlobStore;

/// Queue the job workers drain.
pub const EXECUTION_QUEUE: &str = "execution_queue";

const RESULT_PREFIX: &str = "result_";
const RESULT_TTL_SECS: u64 = 3600;

const HEARTBEAT_KEY: &str = "workers_alive";
const HEARTBEAT_TTL_SECS: u64 = 15;

/// Published outcome of one task, written exactly once per task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskResult {
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },
}

/// Redis-backed execution backend: job queue, result store and the
/// shared market-data byte cache all live here under separate key
/// namespaces. The queue delivers jobs; the keyed entries are the
/// durable task-id map.
#[derive(Clone)]
pub struct Store {
    manager: ConnectionManager,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("redis connection failed")?;
        Ok(Self { manager })
    }

    /// Connect with exponential backoff, for worker startup racing the
    /// broker container.
    pub async fn connect_with_retry(url: &str, max_attempts: u32) -> Result<Self> {
        let mut delay = Duration::from_secs(1);
        for attempt in 1..=max_attempts {
            match Self::connect(url).await {
                Ok(store) => {
                    tracing::info!("connected to broker");
                    return Ok(store);
                }
                Err(e) if attempt < max_attempts => {
                    tracing::warn!(attempt, error = %e, "broker connection failed, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop returns before exhausting attempts")
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    // ---- job queue ----

    pub async fn enqueue(&self, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.lpush(EXECUTION_QUEUE, payload).await?;
        Ok(())
    }

    /// Pop the next job into this worker's processing list so a crash
    /// between pop and ack leaves the payload recoverable
    /// (at-least-once delivery). Returns `None` on timeout.
    pub async fn next_job(&self, worker: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = conn
            .brpoplpush(
                EXECUTION_QUEUE,
                processing_key(worker),
                timeout.as_secs_f64(),
            )
            .await?;
        Ok(payload)
    }

    /// Acknowledge a completed job by dropping it from the processing
    /// list.
    pub async fn ack_job(&self, worker: &str, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.lrem(processing_key(worker), 1, payload).await?;
        Ok(())
    }

    // ---- result store ----

    /// Write the result for `task_id` exactly once. Returns `false`
    /// when a result is already present; the store refuses overwrites
    /// so completion stays observable.
    pub async fn publish_result(&self, task_id: &str, result: &TaskResult) -> Result<bool> {
        let payload = serde_json::to_string(result)?;
        let mut conn = self.manager.clone();
        let written: Option<String> = redis::cmd("SET")
            .arg(result_key(task_id))
            .arg(payload)
            .arg("NX")
            .arg("EX")
            .arg(RESULT_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(written.is_some())
    }

    pub async fn fetch_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = conn.get(result_key(task_id)).await?;
        match payload {
            None => Ok(None),
            Some(p) => Ok(Some(
                serde_json::from_str(&p).context("malformed stored task result")?,
            )),
        }
    }

    // ---- worker liveness ----

    /// Refreshed by every job worker between jobs so the health surface
    /// can tell whether anyone is draining the queue.
    pub async fn heartbeat(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(HEARTBEAT_KEY, "1", HEARTBEAT_TTL_SECS).await?;
        Ok(())
    }

    pub async fn workers_alive(&self) -> bool {
        let mut conn = self.manager.clone();
        conn.exists::<_, bool>(HEARTBEAT_KEY)
            .await
            .unwrap_or(false)
    }
}

fn processing_key(worker: &str) -> String {
    format!("processing_{worker}")
}

fn result_key(task_id: &str) -> String {
    format!("{RESULT_PREFIX}{task_id}")
}

/// The shared market-data byte cache rides on the same backend.
#[async_trait]
impl BlobStore for Store {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let written: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(written.is_some())
    }
}
