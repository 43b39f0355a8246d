pub mod harness;
pub mod report;
pub mod script;
pub mod vet;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::data::PriceFrame;
use report::StrategyResult;

/// File names staged into the scratch directory. The stager writes them
/// on the host; the runtime reads them inside the sandbox.
pub const CODE_FILE: &str = "code.rhai";
pub const DATA_FILE: &str = "data.parquet";
pub const CONFIG_FILE: &str = "config.txt";

/// Exit code for missing or unreadable staged inputs.
pub const EXIT_BAD_INPUTS: i32 = 2;
/// Exit code for rejected or faulting user code.
pub const EXIT_USER_FAULT: i32 = 1;

/// Harness parameters extracted from the request parameter map.
#[derive(Debug, Clone, Copy)]
pub struct HarnessParams {
    pub initial_capital: f64,
    pub investment_per_trade: f64,
    /// 0 closes the worst open trade first (loss-cutting), 1 closes the
    /// best first (profit-taking). Anything else behaves as 0.
    pub trading_method: i64,
}

impl Default for HarnessParams {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            investment_per_trade: 10_000.0,
            trading_method: 0,
        }
    }
}

impl HarnessParams {
    pub fn from_map(params: &HashMap<String, f64>) -> Self {
        let defaults = Self::default();
        Self {
            initial_capital: params
                .get("initialCapital")
                .copied()
                .unwrap_or(defaults.initial_capital),
            investment_per_trade: params
                .get("investmentPerTrade")
                .copied()
                .unwrap_or(defaults.investment_per_trade),
            trading_method: params
                .get("trading_method")
                .map(|v| *v as i64)
                .unwrap_or(defaults.trading_method),
        }
    }
}

/// Serialize a parameter map into the staged `config.txt` form: one
/// `key=value` line per parameter, keys sorted, floats in plain decimal
/// notation regardless of locale.
pub fn format_params(params: &HashMap<String, f64>) -> String {
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    let mut out = String::new();
    for key in keys {
        let _ = writeln!(out, "{key}={}", params[key]);
    }
    out
}

pub fn parse_params(text: &str) -> anyhow::Result<HashMap<String, f64>> {
    let mut params = HashMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("config line {} is not key=value", lineno + 1))?;
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("config value for '{key}': {e}"))?;
        params.insert(key.trim().to_string(), value);
    }
    Ok(params)
}

/// Failure modes of one sandbox run, mapped to exit codes by the
/// `execute` binary.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Staged inputs missing or unreadable (exit 2).
    #[error("input error: {0}")]
    Input(String),

    /// Static validator rejected the code (exit 1).
    #[error("invalid user code: {0}")]
    Rejected(#[from] vet::VetError),

    /// Code was accepted but misbehaved at run time (exit 1).
    #[error("{0}")]
    User(String),
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Input(_) => EXIT_BAD_INPUTS,
            RunError::Rejected(_) | RunError::User(_) => EXIT_USER_FAULT,
        }
    }
}

/// Run one staged backtest: load the three inputs, vet the script, bind
/// `generate_signals` into the harness, run the loop and produce the
/// report.
pub fn execute(input_dir: &Path) -> Result<StrategyResult, RunError> {
    let code_path = input_dir.join(CODE_FILE);
    let data_path = input_dir.join(DATA_FILE);
    let config_path = input_dir.join(CONFIG_FILE);

    let code = std::fs::read_to_string(&code_path)
        .map_err(|e| RunError::Input(format!("{}: {e}", code_path.display())))?;
    let data = std::fs::read(&data_path)
        .map_err(|e| RunError::Input(format!("{}: {e}", data_path.display())))?;
    let config = std::fs::read_to_string(&config_path)
        .map_err(|e| RunError::Input(format!("{}: {e}", config_path.display())))?;

    let frame = PriceFrame::from_parquet_bytes(&data)
        .map_err(|e| RunError::Input(format!("{}: {e:#}", data_path.display())))?;
    let params = parse_params(&config)
        .map_err(|e| RunError::Input(format!("{}: {e:#}", config_path.display())))?;
    let params = HarnessParams::from_map(&params);

    tracing::info!(rows = frame.height(), "inputs loaded, vetting user code");
    let strategy = script::ScriptStrategy::compile(&code)?;

    tracing::info!("running backtest");
    harness::run_backtest(&frame, &strategy, &params)
}
