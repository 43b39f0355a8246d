use redis::aio::ConnectionManager;
use std::time::Duration;

/// One fixed-window limit for a request scope.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub scope: &'static str,
    pub limit: u64,
    pub window: Duration,
}

/// Submission is deliberately tight: one backtest per minute per
/// client; polling and health checks are cheap.
pub const EXECUTE_LIMIT: RateLimit = RateLimit {
    scope: "execute",
    limit: 1,
    window: Duration::from_secs(60),
};

pub const TASK_LIMIT: RateLimit = RateLimit {
    scope: "task",
    limit: 30,
    window: Duration::from_secs(60),
};

pub const HEALTH_LIMIT: RateLimit = RateLimit {
    scope: "health",
    limit: 1000,
    window: Duration::from_secs(3600),
};

/// Fixed-window counters in Redis, keyed by scope and client identity.
/// When Redis is unreachable the limiter fails open; the submission
/// path's own health gate rejects the request anyway.
pub struct RateLimiter {
    manager: ConnectionManager,
}

impl RateLimiter {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Count one hit and report whether the client is still inside the
    /// window's allowance.
    pub async fn check(&self, limit: &RateLimit, client: &str) -> bool {
        let key = format!("throttle_{}_{client}", limit.scope);
        match self.hit(&key, limit.window).await {
            Ok(count) => count <= limit.limit,
            Err(e) => {
                tracing::warn!(error = %e, scope = limit.scope, "rate limiter unavailable, failing open");
                true
            }
        }
    }

    async fn hit(&self, key: &str, window: Duration) -> redis::RedisResult<u64> {
        let mut conn = self.manager.clone();
        let count: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        if count == 1 {
            let _: bool = redis::cmd("EXPIRE")
                .arg(key)
                .arg(window.as_secs())
                .query_async(&mut conn)
                .await?;
        }
        Ok(count)
    }
}
