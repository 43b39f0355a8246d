use std::time::Duration;

/// Process configuration, read once at startup.
///
/// | Env Var | Default | Purpose |
/// |---------|---------|---------|
/// | `DATA_URL` | (none) | Base URL for price CSVs; symbol is appended |
/// | `BROKER_URL` | `redis://127.0.0.1:6379/0` | Job queue |
/// | `RESULT_BACKEND_URL` | same as `BROKER_URL` | Result store + shared cache |
/// | `RUNTIME_WORKER` | `false` | `true` marks a job-worker process |
/// | `HOST_TMPFS_BIND` | `/host_tmpfs` | Scratch mount point inside the sandbox |
/// | `TMPFS_ROOT` | `/mnt/tradecell-tmpfs` | Host tmpfs root for scratch dirs |
/// | `SANDBOX_IMAGE` | `code-sandbox` | Sandbox container image |
/// | `SANDBOX_NETWORK` | `backend_backend` | Private network for sandboxes |
/// | `POOL_SIZE` | `2` | Number of long-lived sandbox workers |
/// | `BIND_ADDR` | `0.0.0.0:8000` | HTTP listen address |
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL for price CSVs. The symbol is appended verbatim.
    pub data_url: Option<String>,

    /// Redis URL for the job queue.
    pub broker_url: String,

    /// Redis URL for the result store and shared market-data cache.
    /// Usually the same instance as the broker.
    pub result_backend_url: String,

    /// Whether this process consumes the execution queue. The sandbox
    /// pool is only constructed when this is set.
    pub runtime_worker: bool,

    /// Mount point of the scratch directory inside the sandbox.
    pub host_tmpfs_bind: String,

    /// Host directory (memory-backed) under which per-worker scratch
    /// directories are created.
    pub tmpfs_root: String,

    /// Image every sandbox worker runs.
    pub sandbox_image: String,

    /// Private network sandboxes attach to.
    pub sandbox_network: String,

    /// Number of sandbox workers. Also the capacity of the idle
    /// hand-off queue, so it bounds in-flight executions per host.
    pub pool_size: usize,

    /// HTTP listen address (server mode only).
    pub bind_addr: String,

    /// Wall deadline for acquiring a sandbox worker.
    pub acquire_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let broker_url = std::env::var("BROKER_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
        let result_backend_url =
            std::env::var("RESULT_BACKEND_URL").unwrap_or_else(|_| broker_url.clone());

        Self {
            data_url: std::env::var("DATA_URL").ok(),
            broker_url,
            result_backend_url,
            runtime_worker: std::env::var("RUNTIME_WORKER")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            host_tmpfs_bind: std::env::var("HOST_TMPFS_BIND")
                .unwrap_or_else(|_| "/host_tmpfs".to_string()),
            tmpfs_root: std::env::var("TMPFS_ROOT")
                .unwrap_or_else(|_| "/mnt/tradecell-tmpfs".to_string()),
            sandbox_image: std::env::var("SANDBOX_IMAGE")
                .unwrap_or_else(|_| "code-sandbox".to_string()),
            sandbox_network: std::env::var("SANDBOX_NETWORK")
                .unwrap_or_else(|_| "backend_backend".to_string()),
            pool_size: std::env::var("POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                // A zero-sized pool can never serve a lease.
                .map(|n: usize| n.max(1))
                .unwrap_or(2),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}
