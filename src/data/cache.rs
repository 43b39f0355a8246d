use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::fetch::{self, PriceOrigin};
use super::PriceFrame;
use crate::error::{EngineError, EngineResult};

/// Shared cache TTL for a fetched price series.
pub const CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long a parsed frame stays in the per-process memo. The byte blob
/// in the shared store is authoritative; this only skips re-parsing.
const MEMO_TTL: Duration = Duration::from_secs(600);

/// Byte-blob store shared across worker processes. Writers must use
/// set-if-absent so a torn entry cannot be observed under contention.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> anyhow::Result<bool>;
}

fn cache_key(symbol: &str) -> String {
    format!("data_{symbol}")
}

/// Market-data cache: origin CSV → parsed frame, memoised as a Parquet
/// blob in the shared store and as a parsed frame per process.
pub struct MarketDataCache {
    store: Arc<dyn BlobStore>,
    origin: Arc<dyn PriceOrigin>,
    memo: DashMap<String, (Instant, Arc<PriceFrame>)>,
}

impl MarketDataCache {
    pub fn new(store: Arc<dyn BlobStore>, origin: Arc<dyn PriceOrigin>) -> Self {
        Self {
            store,
            origin,
            memo: DashMap::new(),
        }
    }

    /// Return the price series for `symbol`, fetching from the origin
    /// only when neither the memo nor the shared store has it. Fetch
    /// failures propagate as `DataUnavailable` and poison nothing.
    pub async fn get(&self, symbol: &str) -> EngineResult<Arc<PriceFrame>> {
        if let Some(entry) = self.memo.get(symbol) {
            let (stored_at, frame) = entry.value();
            if stored_at.elapsed() < MEMO_TTL {
                tracing::debug!(%symbol, "market data memo hit");
                return Ok(Arc::clone(frame));
            }
        }

        let key = cache_key(symbol);
        if let Some(bytes) = self
            .store
            .get(&key)
            .await
            .map_err(|e| EngineError::ServiceUnavailable(format!("cache store: {e:#}")))?
        {
            tracing::debug!(%symbol, "market data cache hit");
            let frame =
                Arc::new(
                    PriceFrame::from_parquet_bytes(&bytes).map_err(|e| {
                        EngineError::DataUnavailable {
                            symbol: symbol.to_string(),
                            reason: format!("cached entry unreadable: {e:#}"),
                        }
                    })?,
                );
            self.memo
                .insert(symbol.to_string(), (Instant::now(), Arc::clone(&frame)));
            return Ok(frame);
        }

        tracing::info!(%symbol, "market data cache miss, fetching from origin");
        let raw = self.origin.fetch(symbol).await?;
        let frame = Arc::new(fetch::parse_csv(symbol, &raw)?);

        let encoded = frame
            .to_parquet_bytes()
            .map_err(|e| EngineError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: format!("encode failed: {e:#}"),
            })?;
        // A concurrent writer may have won the race; either entry is
        // equivalent, so the losing write is simply dropped.
        let _ = self
            .store
            .set_if_absent(&key, &encoded, CACHE_TTL)
            .await
            .map_err(|e| EngineError::ServiceUnavailable(format!("cache store: {e:#}")))?;

        self.memo
            .insert(symbol.to_string(), (Instant::now(), Arc::clone(&frame)));
        Ok(frame)
    }
}
