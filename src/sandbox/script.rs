use rhai::{Array, Dynamic, Engine, Map, Scope, AST};
use rust_ti::standard_indicators::bulk as sti;

use super::harness::{FrameColumns, SignalGenerator};
use super::vet;
use super::RunError;

/// Operation ceiling for one strategy evaluation. Generous for a few
/// thousand bars of indicator math, far below anything abusive.
const MAX_OPERATIONS: u64 = 50_000_000;

/// Bars the standard RSI needs before it produces a value.
const RSI_PERIOD: usize = 14;

/// Build the evaluation engine: resource limits plus the indicator
/// library every strategy sees (`sma`, `ema`, `rsi`, `highest`,
/// `lowest`, `shift`, `pct_change`).
pub fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_array_size(1_000_000);
    engine.set_max_map_size(10_000);
    engine.set_max_string_size(1_000_000);

    engine.register_fn("sma", |values: Array, period: i64| {
        windowed(&to_floats(&values), period, |prices, period| {
            sti::simple_moving_average(prices, period)
        })
    });
    engine.register_fn("ema", |values: Array, period: i64| {
        windowed(&to_floats(&values), period, |prices, period| {
            sti::exponential_moving_average(prices, period)
        })
    });
    engine.register_fn("rsi", |values: Array| {
        windowed(&to_floats(&values), RSI_PERIOD as i64, |prices, _| {
            sti::rsi(prices)
        })
    });
    engine.register_fn("highest", |values: Array, period: i64| {
        windowed(&to_floats(&values), period, |prices, period| {
            rust_ti::basic_indicators::bulk::max(prices, period)
        })
    });
    engine.register_fn("lowest", |values: Array, period: i64| {
        windowed(&to_floats(&values), period, |prices, period| {
            rust_ti::basic_indicators::bulk::min(prices, period)
        })
    });
    engine.register_fn("shift", |values: Array, periods: i64| shift(&to_floats(&values), periods));
    engine.register_fn("pct_change", |values: Array| pct_change(&to_floats(&values)));

    engine
}

fn to_floats(values: &Array) -> Vec<f64> {
    values
        .iter()
        .map(|v| {
            v.as_float()
                .or_else(|_| v.as_int().map(|i| i as f64))
                .unwrap_or(f64::NAN)
        })
        .collect()
}

fn to_array(values: Vec<f64>) -> Array {
    values.into_iter().map(Dynamic::from_float).collect()
}

/// Run a bulk indicator over a trailing window and pad the warm-up bars
/// with NaN so the output lines up with the frame. Series shorter than
/// the window come back all-NaN instead of panicking inside the
/// indicator crate.
fn windowed(
    values: &[f64],
    period: i64,
    f: impl Fn(&[f64], usize) -> Vec<f64>,
) -> Array {
    let n = values.len();
    let period = period.max(1) as usize;
    if n < period {
        return to_array(vec![f64::NAN; n]);
    }
    to_array(pad_front(f(values, period), n))
}

/// Front-pad a bulk-indicator result (one value per full window) with
/// NaN up to the frame length.
fn pad_front(computed: Vec<f64>, n: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; n.saturating_sub(computed.len())];
    out.extend(computed);
    out
}

fn shift(values: &[f64], periods: i64) -> Array {
    let out: Vec<f64> = (0..values.len() as i64)
        .map(|i| {
            let src = i - periods;
            if src >= 0 && (src as usize) < values.len() {
                values[src as usize]
            } else {
                f64::NAN
            }
        })
        .collect();
    to_array(out)
}

fn pct_change(values: &[f64]) -> Array {
    let out: Vec<f64> = (0..values.len())
        .map(|i| {
            if i == 0 {
                f64::NAN
            } else {
                (values[i] - values[i - 1]) / values[i - 1]
            }
        })
        .collect();
    to_array(out)
}

/// A vetted, compiled strategy script bound to the `generate_signals`
/// entry point.
pub struct ScriptStrategy {
    engine: Engine,
    ast: AST,
}

impl ScriptStrategy {
    /// Compile and vet `source`. The AST handed to evaluation is the
    /// one the validator walked.
    pub fn compile(source: &str) -> Result<Self, RunError> {
        let engine = build_engine();
        let ast = vet::vet_source(&engine, source)?;

        if !ast
            .iter_functions()
            .any(|f| f.name == "generate_signals")
        {
            return Err(RunError::User(
                "no valid 'generate_signals' function defined".to_string(),
            ));
        }

        Ok(Self { engine, ast })
    }
}

impl SignalGenerator for ScriptStrategy {
    fn generate(&self, frame: &FrameColumns) -> Result<Vec<i64>, RunError> {
        let mut scope = Scope::new();
        let map = frame_to_map(frame);

        let result: Dynamic = self
            .engine
            .call_fn(&mut scope, &self.ast, "generate_signals", (map,))
            .map_err(|e| RunError::User(format!("strategy execution failed: {e}")))?;

        extract_signals(&result)
    }
}

/// The frame as strategies see it: one array per column plus `date`.
fn frame_to_map(frame: &FrameColumns) -> Map {
    let mut map = Map::new();
    let dates: Array = frame
        .dates
        .iter()
        .map(|d| Dynamic::from(d.clone()))
        .collect();
    map.insert("date".into(), dates.into());
    for (name, values) in &frame.series {
        map.insert(name.as_str().into(), to_array(values.clone()).into());
    }
    map
}

fn extract_signals(result: &Dynamic) -> Result<Vec<i64>, RunError> {
    let map = result.clone().try_cast::<Map>().ok_or_else(|| {
        RunError::User(
            "generate_signals must return the frame with a 'signal' column".to_string(),
        )
    })?;
    let column = map
        .get("signal")
        .ok_or_else(|| RunError::User("no 'signal' column in returned frame".to_string()))?;
    let column = column.clone().try_cast::<Array>().ok_or_else(|| {
        RunError::User("'signal' column must be an array".to_string())
    })?;

    column
        .iter()
        .map(|v| {
            if let Ok(i) = v.as_int() {
                return Ok(i);
            }
            if let Ok(f) = v.as_float() {
                if f.fract() == 0.0 {
                    return Ok(f as i64);
                }
            }
            Err(RunError::User(format!(
                "signal entries must be integers (got {v})"
            )))
        })
        .collect()
}
