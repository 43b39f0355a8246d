#![allow(dead_code)]

use polars::prelude::*;
use std::collections::HashMap;
use std::path::Path;

use tradecell::data::{PriceFrame, CLOSE_COL, DATE_COL};
use tradecell::pool::scratch::stage_inputs;

/// Build a normalized price frame from parallel date/close slices.
pub fn make_frame(dates: &[&str], closes: &[f64]) -> PriceFrame {
    let dates: Vec<String> = dates.iter().map(|d| (*d).to_string()).collect();
    let df = df!(DATE_COL => dates, CLOSE_COL => closes.to_vec()).unwrap();
    PriceFrame::new(df).unwrap()
}

/// The five-bar series the happy-path scenario runs on:
/// closes 100, 102, 101, 103, 105 over the first trading week of 2020.
pub fn week_frame() -> PriceFrame {
    make_frame(
        &[
            "2020-01-02",
            "2020-01-03",
            "2020-01-04",
            "2020-01-05",
            "2020-01-06",
        ],
        &[100.0, 102.0, 101.0, 103.0, 105.0],
    )
}

/// Strategy that buys on the second bar and sells on the last:
/// signal column [0, 1, 0, ..., 0, -1].
pub const BUY_SECOND_SELL_LAST: &str = r#"
fn generate_signals(frame) {
    let n = frame.close.len();
    let sigs = [];
    for i in 0..n {
        if i == 1 {
            sigs.push(1);
        } else if i == n - 1 {
            sigs.push(-1);
        } else {
            sigs.push(0);
        }
    }
    frame.signal = sigs;
    frame
}
"#;

/// Strategy that never trades.
pub const HOLD_FOREVER: &str = r#"
fn generate_signals(frame) {
    let sigs = [];
    for _c in frame.close {
        sigs.push(0);
    }
    frame.signal = sigs;
    frame
}
"#;

pub fn standard_params() -> HashMap<String, f64> {
    let mut params = HashMap::new();
    params.insert("initialCapital".to_string(), 10_000.0);
    params.insert("investmentPerTrade".to_string(), 1_000.0);
    params.insert("trading_method".to_string(), 0.0);
    params
}

/// Stage the three inputs the way the dispatcher would.
pub fn stage(dir: &Path, code: &str, frame: &PriceFrame, params: &HashMap<String, f64>) {
    stage_inputs(dir, code, frame, params).unwrap();
}
