use serde::Serialize;

/// Annual risk-free rate used by Sharpe and Sortino.
const RISK_FREE_RATE: f64 = 0.02;

/// Trading days per year, for annualization.
const TRADING_DAYS: f64 = 252.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    #[serde(rename = "LONG")]
    Long,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub entry_date: String,
    pub exit_date: Option<String>,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub quantity: i64,
    pub side: Side,
    pub pnl: f64,
    pub exit_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurvePoint {
    pub date: String,
    pub value: f64,
}

/// A statistic that can degenerate to a sentinel when its denominator
/// or sample set is empty. Serialised as a bare number or string, the
/// shape the browser client expects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Stat {
    Num(f64),
    Text(&'static str),
}

impl Stat {
    pub const INFINITE: Stat = Stat::Text("∞");
    pub const NOT_AVAILABLE: Stat = Stat::Text("N/A");
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyResult {
    pub initial_capital: f64,
    pub final_capital: f64,
    pub equity_curve: Vec<CurvePoint>,
    pub drawdown_curve: Vec<CurvePoint>,
    pub trades: Vec<Trade>,
    pub total_return: f64,
    pub total_return_pct: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    pub profit_factor: Stat,
    pub num_trades: usize,
    pub avg_trade_pnl: f64,
    pub avg_winner_pnl: Stat,
    pub avg_loser_pnl: Stat,
    pub annualized_volatility: f64,
    pub calmar_ratio: Stat,
    pub sortino_ratio: Stat,
}

/// Assemble the full report from the equity curve and the trade log.
/// `dates` and `equity` are parallel; both may be empty for an empty
/// filtered frame.
pub fn summarize(
    dates: &[String],
    equity: &[f64],
    trades: Vec<Trade>,
    initial_capital: f64,
) -> StrategyResult {
    let final_capital = equity.last().copied().unwrap_or(initial_capital);
    let total_return = final_capital - initial_capital;
    let total_return_pct = if initial_capital > 0.0 {
        (final_capital / initial_capital - 1.0) * 100.0
    } else {
        0.0
    };

    let drawdowns = drawdown_curve(equity);
    let min_drawdown = drawdowns.iter().copied().fold(0.0_f64, f64::min);
    let max_drawdown = min_drawdown * initial_capital;
    let max_drawdown_pct = min_drawdown * 100.0;

    let returns = pct_change(equity);
    let excess: Vec<f64> = returns
        .iter()
        .map(|r| r - RISK_FREE_RATE / TRADING_DAYS)
        .collect();

    let sharpe_ratio = sharpe(&excess);
    let sortino_ratio = sortino(&excess);
    let annualized_volatility = sample_std(&returns) * TRADING_DAYS.sqrt() * 100.0;

    let calmar_ratio = if max_drawdown_pct == 0.0 {
        if total_return_pct > 0.0 {
            Stat::INFINITE
        } else {
            Stat::Num(0.0)
        }
    } else {
        Stat::Num(total_return_pct / max_drawdown_pct.abs())
    };

    let tm = trade_stats(&trades);

    StrategyResult {
        initial_capital,
        final_capital,
        equity_curve: curve_points(dates, equity),
        drawdown_curve: curve_points(dates, &drawdowns),
        trades,
        total_return,
        total_return_pct,
        sharpe_ratio,
        max_drawdown,
        max_drawdown_pct,
        win_rate: tm.win_rate,
        profit_factor: tm.profit_factor,
        num_trades: tm.num_trades,
        avg_trade_pnl: tm.avg_trade_pnl,
        avg_winner_pnl: tm.avg_winner_pnl,
        avg_loser_pnl: tm.avg_loser_pnl,
        annualized_volatility,
        calmar_ratio,
        sortino_ratio,
    }
}

struct TradeStats {
    num_trades: usize,
    win_rate: f64,
    profit_factor: Stat,
    avg_trade_pnl: f64,
    avg_winner_pnl: Stat,
    avg_loser_pnl: Stat,
}

fn trade_stats(trades: &[Trade]) -> TradeStats {
    if trades.is_empty() {
        return TradeStats {
            num_trades: 0,
            win_rate: 0.0,
            profit_factor: Stat::Num(0.0),
            avg_trade_pnl: 0.0,
            avg_winner_pnl: Stat::NOT_AVAILABLE,
            avg_loser_pnl: Stat::NOT_AVAILABLE,
        };
    }

    let total = trades.len() as f64;
    let winners: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
    let losers: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p < 0.0).collect();

    let gross_profit: f64 = winners.iter().sum();
    let gross_loss: f64 = losers.iter().sum::<f64>().abs();

    let profit_factor = if gross_loss == 0.0 {
        if gross_profit > 0.0 {
            Stat::INFINITE
        } else {
            Stat::Num(0.0)
        }
    } else {
        Stat::Num(gross_profit / gross_loss)
    };

    let avg_winner_pnl = if winners.is_empty() {
        Stat::NOT_AVAILABLE
    } else {
        Stat::Num(gross_profit / winners.len() as f64)
    };
    let avg_loser_pnl = if losers.is_empty() {
        Stat::NOT_AVAILABLE
    } else {
        Stat::Num(losers.iter().sum::<f64>() / losers.len() as f64)
    };

    TradeStats {
        num_trades: trades.len(),
        win_rate: winners.len() as f64 / total * 100.0,
        profit_factor,
        avg_trade_pnl: trades.iter().map(|t| t.pnl).sum::<f64>() / total,
        avg_winner_pnl,
        avg_loser_pnl,
    }
}

fn curve_points(dates: &[String], values: &[f64]) -> Vec<CurvePoint> {
    dates
        .iter()
        .zip(values.iter())
        .map(|(date, value)| CurvePoint {
            date: date.clone(),
            value: *value,
        })
        .collect()
}

/// Fractional decline from the running maximum, one entry per bar.
fn drawdown_curve(equity: &[f64]) -> Vec<f64> {
    let mut peak = f64::MIN;
    equity
        .iter()
        .map(|e| {
            if *e > peak {
                peak = *e;
            }
            if peak > 0.0 {
                (e - peak) / peak
            } else {
                0.0
            }
        })
        .collect()
}

/// Bar-over-bar fractional returns with non-finite entries dropped.
fn pct_change(equity: &[f64]) -> Vec<f64> {
    let mut returns = Vec::new();
    for window in equity.windows(2) {
        let (prev, curr) = (window[0], window[1]);
        let r = (curr - prev) / prev;
        if r.is_finite() {
            returns.push(r);
        }
    }
    returns
}

/// Sample standard deviation (n - 1 denominator); 0 below two samples.
fn sample_std(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let mean = data.iter().sum::<f64>() / data.len() as f64;
    let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

fn sharpe(excess: &[f64]) -> f64 {
    if excess.is_empty() {
        return 0.0;
    }
    let std = sample_std(excess);
    if std > 0.0 {
        TRADING_DAYS.sqrt() * mean(excess) / std
    } else {
        0.0
    }
}

fn sortino(excess: &[f64]) -> Stat {
    if excess.is_empty() {
        return Stat::Num(0.0);
    }
    let downside: Vec<f64> = excess.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return if mean(excess) > 0.0 {
            Stat::INFINITE
        } else {
            Stat::Num(0.0)
        };
    }
    let std = sample_std(&downside);
    if std > 0.0 && std.is_finite() {
        Stat::Num(TRADING_DAYS.sqrt() * mean(excess) / std)
    } else {
        Stat::Num(0.0)
    }
}
