use thiserror::Error;

/// Failure taxonomy for the execution pipeline.
///
/// Only `SandboxTransient` is eligible for retry; everything else either
/// surfaces on the submission response (`Validation`,
/// `ServiceUnavailable`) or is published as an error task result.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("market data unavailable for '{symbol}': {reason}")]
    DataUnavailable { symbol: String, reason: String },

    #[error("no sandbox worker available within {0} seconds")]
    PoolExhausted(u64),

    #[error("failed to stage inputs: {0}")]
    Staging(String),

    #[error("sandbox backend error: {0}")]
    SandboxTransient(String),

    #[error("sandbox execution failed: {0}")]
    SandboxFatal(String),
}

impl EngineError {
    /// Transient container-API failures are retried by the dispatcher;
    /// every other variant publishes immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::SandboxTransient(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_retry() {
        assert!(EngineError::SandboxTransient("api down".into()).is_retryable());
        assert!(!EngineError::PoolExhausted(30).is_retryable());
        assert!(!EngineError::DataUnavailable {
            symbol: "XYZ".into(),
            reason: "404".into()
        }
        .is_retryable());
        assert!(!EngineError::SandboxFatal("exit 1".into()).is_retryable());
    }
}
