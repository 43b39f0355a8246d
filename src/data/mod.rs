pub mod cache;
pub mod fetch;

use anyhow::{Context, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Canonical date column name after normalization. Values are ISO-8601
/// `YYYY-MM-DD` strings, which compare in calendar order.
pub const DATE_COL: &str = "date";

/// Canonical close-price column name after normalization.
pub const CLOSE_COL: &str = "close";

/// Inclusive date window of a backtest request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRange {
    pub from: String,
    pub to: String,
}

/// A normalized price series: a `date` column of ISO strings plus
/// lowercase numeric columns, at least `close` as `f64`.
///
/// Frames handed out by the cache are immutable; `filter` produces a new
/// frame and leaves the source untouched.
#[derive(Debug, Clone)]
pub struct PriceFrame(DataFrame);

impl PriceFrame {
    /// Wrap an already-normalized frame, verifying the column contract.
    pub fn new(df: DataFrame) -> Result<Self> {
        df.column(DATE_COL)
            .with_context(|| format!("price frame is missing the '{DATE_COL}' column"))?;
        df.column(CLOSE_COL)
            .with_context(|| format!("price frame is missing the '{CLOSE_COL}' column"))?;
        Ok(Self(df))
    }

    pub fn inner(&self) -> &DataFrame {
        &self.0
    }

    pub fn height(&self) -> usize {
        self.0.height()
    }

    /// Rows whose date lies within `[from, to]`, both ends inclusive,
    /// in the original row order. Missing dates are simply absent rows.
    pub fn filter(&self, range: &DateRange) -> Result<Self> {
        let filtered = self
            .0
            .clone()
            .lazy()
            .filter(
                col(DATE_COL)
                    .gt_eq(lit(range.from.as_str()))
                    .and(col(DATE_COL).lt_eq(lit(range.to.as_str()))),
            )
            .collect()
            .context("date-window filter failed")?;
        Ok(Self(filtered))
    }

    pub fn dates(&self) -> Result<Vec<String>> {
        let ca = self.0.column(DATE_COL)?.str()?;
        Ok(ca.into_no_null_iter().map(ToString::to_string).collect())
    }

    pub fn closes(&self) -> Result<Vec<f64>> {
        let ca = self.0.column(CLOSE_COL)?.f64()?;
        Ok(ca.into_no_null_iter().collect())
    }

    /// The on-wire form shared through the cache and staged into the
    /// sandbox: a Parquet-encoded copy of the frame.
    pub fn to_parquet_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut df = self.0.clone();
        ParquetWriter::new(&mut buf)
            .finish(&mut df)
            .context("failed to encode price frame as parquet")?;
        Ok(buf)
    }

    pub fn from_parquet_bytes(bytes: &[u8]) -> Result<Self> {
        let df = ParquetReader::new(Cursor::new(bytes))
            .finish()
            .context("failed to decode cached price frame")?;
        Self::new(df)
    }
}
