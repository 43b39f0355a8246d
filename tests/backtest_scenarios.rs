//! End-to-end runtime scenarios: inputs staged exactly as the
//! dispatcher stages them, then executed through the sandbox runtime
//! entry path.

mod common;

use common::{make_frame, stage, standard_params, week_frame, BUY_SECOND_SELL_LAST, HOLD_FOREVER};
use tradecell::sandbox::report::Stat;
use tradecell::sandbox::{self, RunError, EXIT_BAD_INPUTS, EXIT_USER_FAULT};

#[test]
fn happy_path_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    stage(
        dir.path(),
        BUY_SECOND_SELL_LAST,
        &week_frame(),
        &standard_params(),
    );

    let result = sandbox::execute(dir.path()).unwrap();

    assert_eq!(result.num_trades, 1);
    let trade = &result.trades[0];
    assert_eq!(trade.quantity, 9);
    assert_eq!(trade.entry_price, 102.0);
    assert_eq!(trade.exit_price, Some(105.0));
    assert!((trade.pnl - 27.0).abs() < 1e-9);

    assert_eq!(result.win_rate, 100.0);
    assert!((result.final_capital - 10_027.0).abs() < 1e-6);
    assert_eq!(result.equity_curve.len(), 5);
    assert_eq!(result.equity_curve[0].date, "2020-01-02");
    assert_eq!(result.equity_curve[0].value, 10_000.0);
}

#[test]
fn insufficient_capital_opens_no_trades() {
    let dir = tempfile::tempdir().unwrap();
    let frame = make_frame(
        &[
            "2020-01-02",
            "2020-01-03",
            "2020-01-04",
            "2020-01-05",
            "2020-01-06",
        ],
        &[2_000.0, 2_040.0, 2_020.0, 2_060.0, 2_100.0],
    );
    let mut params = standard_params();
    params.insert("investmentPerTrade".to_string(), 10.0);
    stage(dir.path(), BUY_SECOND_SELL_LAST, &frame, &params);

    let result = sandbox::execute(dir.path()).unwrap();

    assert_eq!(result.num_trades, 0);
    assert_eq!(result.final_capital, 10_000.0);
    assert_eq!(result.total_return, 0.0);
    assert_eq!(result.avg_winner_pnl, Stat::NOT_AVAILABLE);
    assert_eq!(result.avg_loser_pnl, Stat::NOT_AVAILABLE);
}

#[test]
fn dangerous_attribute_is_rejected_with_exit_one() {
    let dir = tempfile::tempdir().unwrap();
    let code = r#"
        fn generate_signals(frame) {
            let leaked = frame.__class__;
            frame
        }
    "#;
    stage(dir.path(), code, &week_frame(), &standard_params());

    let err = sandbox::execute(dir.path()).unwrap_err();
    assert!(matches!(err, RunError::Rejected(_)));
    assert_eq!(err.exit_code(), EXIT_USER_FAULT);
    assert!(err.to_string().contains("__class__"));
}

#[test]
fn missing_entry_point_names_the_function() {
    let dir = tempfile::tempdir().unwrap();
    stage(
        dir.path(),
        "fn f(x) { x }",
        &week_frame(),
        &standard_params(),
    );

    let err = sandbox::execute(dir.path()).unwrap_err();
    assert_eq!(err.exit_code(), EXIT_USER_FAULT);
    assert!(err.to_string().contains("generate_signals"));
}

#[test]
fn empty_scratch_dir_is_an_input_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = sandbox::execute(dir.path()).unwrap_err();
    assert!(matches!(err, RunError::Input(_)));
    assert_eq!(err.exit_code(), EXIT_BAD_INPUTS);
}

#[test]
fn corrupt_data_file_is_an_input_error() {
    let dir = tempfile::tempdir().unwrap();
    stage(
        dir.path(),
        BUY_SECOND_SELL_LAST,
        &week_frame(),
        &standard_params(),
    );
    std::fs::write(dir.path().join("data.parquet"), b"not parquet").unwrap();

    let err = sandbox::execute(dir.path()).unwrap_err();
    assert_eq!(err.exit_code(), EXIT_BAD_INPUTS);
}

#[test]
fn runtime_fault_in_user_code_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let code = r#"
        fn generate_signals(frame) {
            frame.signal = frame.no_such_column;
            frame
        }
    "#;
    stage(dir.path(), code, &week_frame(), &standard_params());

    let err = sandbox::execute(dir.path()).unwrap_err();
    assert!(matches!(err, RunError::User(_)));
    assert_eq!(err.exit_code(), EXIT_USER_FAULT);
}

#[test]
fn hold_strategy_leaves_capital_untouched() {
    let dir = tempfile::tempdir().unwrap();
    stage(
        dir.path(),
        HOLD_FOREVER,
        &week_frame(),
        &standard_params(),
    );

    let result = sandbox::execute(dir.path()).unwrap();
    assert_eq!(result.num_trades, 0);
    assert!(result.equity_curve.iter().all(|p| p.value == 10_000.0));
    assert!(result.drawdown_curve.iter().all(|p| p.value == 0.0));
}

#[test]
fn capital_conservation_and_drawdown_bound() {
    let dir = tempfile::tempdir().unwrap();
    // A longer series with a dip so the drawdown curve is non-trivial.
    let frame = make_frame(
        &[
            "2020-02-03",
            "2020-02-04",
            "2020-02-05",
            "2020-02-06",
            "2020-02-07",
            "2020-02-10",
            "2020-02-11",
            "2020-02-12",
        ],
        &[50.0, 50.0, 48.0, 45.0, 47.0, 52.0, 53.0, 53.0],
    );
    stage(
        dir.path(),
        BUY_SECOND_SELL_LAST,
        &frame,
        &standard_params(),
    );

    let result = sandbox::execute(dir.path()).unwrap();

    // One trade, entered at 50 on the second bar, closed on the last at
    // 53: quantity 20, pnl 60, and the whole path is visible in equity.
    assert_eq!(result.num_trades, 1);
    assert_eq!(result.trades[0].quantity, 20);
    assert!((result.trades[0].pnl - 60.0).abs() < 1e-9);

    let pnl_sum: f64 = result.trades.iter().map(|t| t.pnl).sum();
    let relative = (result.final_capital - (result.initial_capital + pnl_sum)).abs()
        / result.initial_capital;
    assert!(relative < 1e-6, "capital drifted by {relative}");

    assert!(result.drawdown_curve.iter().all(|p| p.value <= 0.0));
    assert!(result.max_drawdown_pct <= 0.0);
    assert!(result.max_drawdown <= 0.0);
}

#[test]
fn report_json_uses_reference_field_names() {
    let dir = tempfile::tempdir().unwrap();
    stage(
        dir.path(),
        BUY_SECOND_SELL_LAST,
        &week_frame(),
        &standard_params(),
    );

    let result = sandbox::execute(dir.path()).unwrap();
    let json = serde_json::to_value(&result).unwrap();

    assert!(json["initialCapital"].is_number());
    assert!(json["finalCapital"].is_number());
    assert!(json["equityCurve"].is_array());
    assert!(json["drawdownCurve"].is_array());
    assert_eq!(json["numTrades"], serde_json::json!(1));
    assert_eq!(json["trades"][0]["side"], serde_json::json!("LONG"));
    assert_eq!(
        json["equityCurve"][0]["date"],
        serde_json::json!("2020-01-02")
    );
}

#[test]
fn filtered_subrange_behaves_like_a_fresh_series() {
    use tradecell::data::DateRange;

    // The dispatcher filters before staging; the runtime must see only
    // the window.
    let frame = make_frame(
        &[
            "2019-12-30",
            "2020-01-02",
            "2020-01-03",
            "2020-01-04",
            "2020-01-05",
            "2020-01-06",
            "2020-01-07",
        ],
        &[90.0, 100.0, 102.0, 101.0, 103.0, 105.0, 99.0],
    );
    let filtered = frame
        .filter(&DateRange {
            from: "2020-01-02".to_string(),
            to: "2020-01-06".to_string(),
        })
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    stage(
        dir.path(),
        BUY_SECOND_SELL_LAST,
        &filtered,
        &standard_params(),
    );

    let result = sandbox::execute(dir.path()).unwrap();
    assert_eq!(result.equity_curve.len(), 5);
    assert_eq!(result.equity_curve[0].date, "2020-01-02");
    assert!((result.final_capital - 10_027.0).abs() < 1e-6);
}
