use ordered_float::OrderedFloat;
use polars::prelude::*;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::report::{self, Side, StrategyResult, Trade};
use super::{HarnessParams, RunError};
use crate::data::{PriceFrame, DATE_COL};

/// Column-oriented view of a price frame handed to the signal
/// generator: the date strings plus every numeric column as `f64`
/// (nulls become NaN).
pub struct FrameColumns {
    pub dates: Vec<String>,
    pub series: Vec<(String, Vec<f64>)>,
}

impl FrameColumns {
    pub fn from_frame(frame: &PriceFrame) -> Result<Self, RunError> {
        let dates = frame
            .dates()
            .map_err(|e| RunError::Input(format!("{e:#}")))?;

        let mut series = Vec::new();
        for column in frame.inner().columns() {
            let name = column.name().to_string();
            if name == DATE_COL {
                continue;
            }
            let is_numeric = matches!(
                column.dtype(),
                DataType::Float64
                    | DataType::Float32
                    | DataType::Int64
                    | DataType::Int32
                    | DataType::UInt64
                    | DataType::UInt32
            );
            if !is_numeric {
                continue;
            }
            let values: Vec<f64> = column
                .cast(&DataType::Float64)
                .and_then(|c| Ok(c.f64()?.into_iter().collect::<Vec<_>>()))
                .map_err(|e| RunError::Input(format!("column '{name}': {e}")))?
                .into_iter()
                .map(|v| v.unwrap_or(f64::NAN))
                .collect();
            series.push((name, values));
        }

        Ok(Self { dates, series })
    }

    pub fn closes(&self) -> Option<&[f64]> {
        self.series
            .iter()
            .find(|(name, _)| name == "close")
            .map(|(_, values)| values.as_slice())
    }
}

/// The strategy seam: anything that can derive a signal column from the
/// frame. The sandbox runtime plugs a compiled script in here; tests
/// plug in plain closures.
pub trait SignalGenerator {
    /// One entry per bar, each in {-1, 0, +1}.
    fn generate(&self, frame: &FrameColumns) -> Result<Vec<i64>, RunError>;
}

impl<F> SignalGenerator for F
where
    F: Fn(&FrameColumns) -> Result<Vec<i64>, RunError>,
{
    fn generate(&self, frame: &FrameColumns) -> Result<Vec<i64>, RunError> {
        self(frame)
    }
}

/// Heap key for an open trade. Method 0 closes the worst performer
/// first, method 1 the best; ties fall back to insertion order.
fn priority(pnl: f64, trading_method: i64) -> OrderedFloat<f64> {
    OrderedFloat(if trading_method == 1 { -pnl } else { pnl })
}

/// Run the backtest loop over `frame` with signals from `generator`.
///
/// State per bar: available capital, the open-trade set ordered by
/// running pnl, the equity curve. The scan starts at index 1 because
/// mark-to-market needs the previous close.
pub fn run_backtest(
    frame: &PriceFrame,
    generator: &dyn SignalGenerator,
    params: &HarnessParams,
) -> Result<StrategyResult, RunError> {
    let columns = FrameColumns::from_frame(frame)?;
    let closes = columns
        .closes()
        .ok_or_else(|| RunError::Input("frame has no close column".to_string()))?
        .to_vec();
    let dates = columns.dates.clone();
    let bars = closes.len();

    let signals = generator.generate(&columns)?;
    if signals.len() != bars {
        return Err(RunError::User(format!(
            "signal column has {} entries for {bars} bars",
            signals.len()
        )));
    }
    if let Some(bad) = signals.iter().find(|s| !(-1..=1).contains(*s)) {
        return Err(RunError::User(format!(
            "signal values must be -1, 0 or 1 (got {bad})"
        )));
    }

    let mut available = params.initial_capital;
    let mut equity = vec![params.initial_capital; bars];
    let mut trades: Vec<Trade> = Vec::new();
    // Rebuilt after every mark-to-market step because running pnl
    // invalidates the keys.
    let mut open: BinaryHeap<Reverse<(OrderedFloat<f64>, usize)>> = BinaryHeap::new();

    for i in 1..bars {
        let price = closes[i];

        if signals[i] == 1 {
            let quantity = (params.investment_per_trade / price).floor() as i64;
            if quantity > 0 {
                let cost = quantity as f64 * price;
                if cost <= available {
                    let index = trades.len();
                    trades.push(Trade {
                        entry_date: dates[i].clone(),
                        exit_date: None,
                        entry_price: price,
                        exit_price: None,
                        quantity,
                        side: Side::Long,
                        pnl: 0.0,
                        exit_reason: "signal".to_string(),
                    });
                    open.push(Reverse((priority(0.0, params.trading_method), index)));
                    available -= cost;
                }
            }
        } else if signals[i] == -1 {
            if let Some(Reverse((_, index))) = open.pop() {
                let trade = &mut trades[index];
                close_trade(trade, price, &dates[i]);
                available += trade.quantity as f64 * price;
            }
        }

        equity[i] = equity[i - 1];
        let delta = closes[i] - closes[i - 1];
        let open_indices: Vec<usize> = open.iter().map(|Reverse((_, index))| *index).collect();
        for index in &open_indices {
            let trade = &mut trades[*index];
            let daily = delta * trade.quantity as f64;
            equity[i] += daily;
            trade.pnl += daily;
        }
        open = open_indices
            .into_iter()
            .map(|index| Reverse((priority(trades[index].pnl, params.trading_method), index)))
            .collect();
    }

    // Close whatever is still open at the last price, priority order.
    if bars > 0 {
        let last_price = closes[bars - 1];
        let last_date = dates[bars - 1].clone();
        while let Some(Reverse((_, index))) = open.pop() {
            let trade = &mut trades[index];
            close_trade(trade, last_price, &last_date);
            available += trade.quantity as f64 * last_price;
        }
    }

    Ok(report::summarize(
        &dates,
        &equity,
        trades,
        params.initial_capital,
    ))
}

fn close_trade(trade: &mut Trade, exit_price: f64, exit_date: &str) {
    trade.exit_date = Some(exit_date.to_string());
    trade.exit_price = Some(exit_price);
    trade.pnl = (exit_price - trade.entry_price) * trade.quantity as f64;
}
