use anyhow::Context;
use async_trait::async_trait;
use polars::prelude::*;
use std::io::Cursor;

use super::{PriceFrame, CLOSE_COL, DATE_COL};
use crate::error::{EngineError, EngineResult};

/// Where raw price CSVs come from. The production origin is an HTTP
/// endpoint serving one CSV per symbol; tests substitute their own.
#[async_trait]
pub trait PriceOrigin: Send + Sync {
    async fn fetch(&self, symbol: &str) -> EngineResult<Vec<u8>>;
}

/// HTTP origin: `GET {base_url}{symbol}`.
pub struct HttpOrigin {
    base_url: String,
    client: reqwest::Client,
}

impl HttpOrigin {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PriceOrigin for HttpOrigin {
    async fn fetch(&self, symbol: &str) -> EngineResult<Vec<u8>> {
        let url = format!("{}{}", self.base_url, symbol);
        tracing::debug!(%symbol, %url, "fetching price series from origin");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(EngineError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: format!("origin returned {}", response.status()),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| EngineError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })?;
        Ok(body.to_vec())
    }
}

/// Parse an origin CSV into a normalized [`PriceFrame`]: header names
/// lowercased and trimmed, the date column kept as ISO strings, `close`
/// cast to `f64`. A series without a date or close column is treated as
/// unavailable, not as a server bug.
pub fn parse_csv(symbol: &str, bytes: &[u8]) -> EngineResult<PriceFrame> {
    normalize(bytes).map_err(|e| EngineError::DataUnavailable {
        symbol: symbol.to_string(),
        reason: format!("{e:#}"),
    })
}

fn normalize(bytes: &[u8]) -> anyhow::Result<PriceFrame> {
    let mut df = CsvReadOptions::default()
        .with_has_header(true)
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()
        .context("CSV parse failed")?;

    let lowered: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.trim().to_lowercase())
        .collect();
    df.set_column_names(&lowered)
        .context("failed to normalize column names")?;

    let df = df
        .lazy()
        .with_columns([
            col(DATE_COL).cast(DataType::String),
            col(CLOSE_COL).cast(DataType::Float64),
        ])
        .collect()
        .context("failed to cast date/close columns")?;

    PriceFrame::new(df)
}
