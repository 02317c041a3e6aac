// =============================================================================
// Backtest executor — deterministic replay of the live engine over history
// =============================================================================
//
// The executor drives the same indicator and condition machinery the live
// runtime uses, bar by bar, with the close of the signal bar as the
// execution price. All indicator functions are causal (the value at bar i
// depends only on bars 0..=i), so computing them once over the full series
// yields exactly the values a live instance would have seen at each bar.
//
// Progress is reported every 100 bars; every 1000 bars the loop yields so a
// long replay cannot starve the runtime. `stop` sets a flag the loop polls
// at every bar.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::algorithm::Algorithm;
use crate::conditions::{evaluate_entry, evaluate_exit};
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::indicators;
use crate::market::series::Series;
use crate::position::{ClosedTrade, Position};
use crate::types::{tick_spec, BacktestStatus};

/// Contracts per simulated entry, matching the live runtime.
const BACKTEST_QUANTITY: u32 = 1;
/// Bars between progress reports.
const PROGRESS_INTERVAL: usize = 100;
/// Bars between cooperative yields.
const YIELD_INTERVAL: usize = 1000;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Persisted backtest definition (`backtests/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestDefinition {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub algorithm_name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Reserved: configured execution delay in ticks, not yet applied.
    #[serde(default)]
    pub lag_ticks: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_modified_at: DateTime<Utc>,
}

impl BacktestDefinition {
    pub fn with_new_id(mut self) -> Self {
        self.id = Uuid::new_v4().to_string();
        self
    }
}

/// Aggregate performance of one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResults {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub average_pnl: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Gross profit / gross loss; `None` when there are no losing trades.
    pub profit_factor: Option<f64>,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    pub average_duration_secs: f64,
    pub total_commission: f64,
    pub ending_capital: f64,
    /// Capital after each closed trade, starting from the initial capital.
    pub equity_curve: Vec<f64>,
    /// Absolute drawdown from the running peak, parallel to `equity_curve`.
    pub drawdown_curve: Vec<f64>,
    pub trades: Vec<ClosedTrade>,
}

/// Live view of one run (also the document persisted into
/// `backtest-results.json` once finished).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestSnapshot {
    pub id: String,
    pub definition_id: String,
    pub name: String,
    pub symbol: String,
    pub algorithm_name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub lag_ticks: u32,
    pub status: BacktestStatus,
    /// 0..=100.
    pub progress: f64,
    pub starting_capital: f64,
    pub commission: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub results: Option<BacktestResults>,
    #[serde(default)]
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

struct Run {
    state: RwLock<BacktestSnapshot>,
    stop_requested: AtomicBool,
}

/// Owns every backtest run in the process.
pub struct BacktestExecutor {
    events: EventBus,
    runs: RwLock<HashMap<String, Arc<Run>>>,
}

impl BacktestExecutor {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new run for `definition` and return its run id.
    pub fn create(
        &self,
        definition: &BacktestDefinition,
        starting_capital: f64,
        commission: f64,
    ) -> String {
        let run_id = Uuid::new_v4().to_string();
        let snapshot = BacktestSnapshot {
            id: run_id.clone(),
            definition_id: definition.id.clone(),
            name: definition.name.clone(),
            symbol: definition.symbol.clone(),
            algorithm_name: definition.algorithm_name.clone(),
            start_date: definition.start_date,
            end_date: definition.end_date,
            lag_ticks: definition.lag_ticks,
            status: BacktestStatus::Created,
            progress: 0.0,
            starting_capital,
            commission,
            error: None,
            results: None,
            logs: Vec::new(),
            created_at: Utc::now(),
        };

        self.runs.write().insert(
            run_id.clone(),
            Arc::new(Run {
                state: RwLock::new(snapshot),
                stop_requested: AtomicBool::new(false),
            }),
        );
        run_id
    }

    pub fn get(&self, run_id: &str) -> Option<BacktestSnapshot> {
        self.runs.read().get(run_id).map(|r| r.state.read().clone())
    }

    pub fn list(&self) -> Vec<BacktestSnapshot> {
        let mut runs: Vec<BacktestSnapshot> = self
            .runs
            .read()
            .values()
            .map(|r| r.state.read().clone())
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Request a cooperative stop. A run that is not RUNNING is unaffected.
    pub fn stop(&self, run_id: &str) -> EngineResult<()> {
        let runs = self.runs.read();
        let run = runs
            .get(run_id)
            .ok_or_else(|| EngineError::not_found("backtest run", run_id))?;
        run.stop_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn delete(&self, run_id: &str) -> EngineResult<()> {
        let removed = self.runs.write().remove(run_id);
        match removed {
            Some(run) => {
                run.stop_requested.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(EngineError::not_found("backtest run", run_id)),
        }
    }

    /// Execute the run to completion on the current task.
    ///
    /// Identical `algorithm` + `series` inputs produce identical trades and
    /// results; nothing in the loop reads the wall clock.
    pub async fn run(
        &self,
        run_id: &str,
        algorithm: Arc<Algorithm>,
        mut series: Series,
    ) -> EngineResult<BacktestResults> {
        let run = self
            .runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("backtest run", run_id))?;

        {
            let mut state = run.state.write();
            if state.status == BacktestStatus::Running {
                return Err(EngineError::Conflict("backtest is already running".into()));
            }
            state.status = BacktestStatus::Running;
            state.progress = 0.0;
            state.results = None;
            state.error = None;
        }
        run.stop_requested.store(false, Ordering::SeqCst);
        self.emit_update(&run);

        let outcome = self.replay(&run, &algorithm, &mut series).await;

        match outcome {
            Ok(results) => {
                {
                    let mut state = run.state.write();
                    // A cooperative stop that broke the loop keeps STOPPED.
                    if state.status == BacktestStatus::Running {
                        state.status = BacktestStatus::Completed;
                        state.progress = 100.0;
                    }
                    state.results = Some(results.clone());
                    push_log(&mut state, format!(
                        "finished: {} trades, total P&L {:.2}",
                        results.total_trades, results.total_pnl
                    ));
                }
                self.emit_update(&run);
                Ok(results)
            }
            Err(e) => {
                {
                    let mut state = run.state.write();
                    state.status = BacktestStatus::Failed;
                    state.error = Some(e.to_string());
                    push_log(&mut state, format!("failed: {e}"));
                }
                self.emit_update(&run);
                warn!(run = %run_id, error = %e, "backtest failed");
                Err(e)
            }
        }
    }

    async fn replay(
        &self,
        run: &Arc<Run>,
        algorithm: &Algorithm,
        series: &mut Series,
    ) -> EngineResult<BacktestResults> {
        let (symbol, starting_capital, commission) = {
            let state = run.state.read();
            (state.symbol.clone(), state.starting_capital, state.commission)
        };
        let tick = tick_spec(&symbol);

        series.validate()?;
        indicators::compute_all(series, &algorithm.indicators)?;

        let count = series.count();
        let mut position = Position::flat();
        let mut entry_signal = String::new();
        let mut trades: Vec<ClosedTrade> = Vec::new();
        let mut capital = starting_capital;
        let mut equity_curve = vec![starting_capital];
        let mut drawdown_curve = vec![0.0];
        let mut peak = starting_capital;

        for i in 0..count {
            if run.stop_requested.load(Ordering::SeqCst) {
                let mut state = run.state.write();
                state.status = BacktestStatus::Stopped;
                push_log(&mut state, format!("stopped at bar {i} of {count}"));
                info!(run = %state.id, bar = i, "backtest stopped cooperatively");
                break;
            }

            let bar = series
                .get_bar(i)
                .ok_or_else(|| EngineError::Internal(format!("bar {i} missing during replay")))?;
            let price = bar.close;

            if position.is_flat() {
                let entry = evaluate_entry(series, &algorithm.entry_conditions, i);
                if let Some((side, text)) = entry.decision() {
                    entry_signal = text.to_string();
                    position = Position::open(side, BACKTEST_QUANTITY, price, bar.timestamp);
                }
            } else if let Some(exit_text) = evaluate_exit(
                series,
                &algorithm.exit_conditions,
                i,
                &position,
                price,
                tick,
            ) {
                let taken_entry = std::mem::take(&mut entry_signal);
                if let Some(trade) = position.close(
                    price,
                    bar.timestamp,
                    commission,
                    tick,
                    taken_entry,
                    exit_text,
                ) {
                    capital += trade.pnl;
                    peak = peak.max(capital);
                    equity_curve.push(capital);
                    drawdown_curve.push(peak - capital);
                    trades.push(trade);
                }
            }

            let progress = (i + 1) as f64 / count as f64 * 100.0;
            run.state.write().progress = progress;
            if (i + 1) % PROGRESS_INTERVAL == 0 {
                self.emit_update(run);
            }
            if (i + 1) % YIELD_INTERVAL == 0 {
                tokio::task::yield_now().await;
            }
        }

        // Close any open position at the final close.
        if !position.is_flat() {
            if let Some(last) = series.get_last() {
                let taken_entry = std::mem::take(&mut entry_signal);
                if let Some(trade) = position.close(
                    last.close,
                    last.timestamp,
                    commission,
                    tick,
                    taken_entry,
                    "end of data".to_string(),
                ) {
                    capital += trade.pnl;
                    peak = peak.max(capital);
                    equity_curve.push(capital);
                    drawdown_curve.push(peak - capital);
                    trades.push(trade);
                }
            }
        }

        Ok(compute_results(capital, trades, equity_curve, drawdown_curve))
    }

    fn emit_update(&self, run: &Arc<Run>) {
        let state = run.state.read();
        self.events.publish(EngineEvent::BacktestUpdate {
            backtest_id: state.id.clone(),
            status: state.status,
            progress: state.progress,
        });
    }
}

fn push_log(state: &mut BacktestSnapshot, message: String) {
    state
        .logs
        .push(format!("{} [{}] {message}", Utc::now().to_rfc3339(), state.name));
}

// ---------------------------------------------------------------------------
// Results math
// ---------------------------------------------------------------------------

fn compute_results(
    ending_capital: f64,
    trades: Vec<ClosedTrade>,
    equity_curve: Vec<f64>,
    drawdown_curve: Vec<f64>,
) -> BacktestResults {
    let total_trades = trades.len();
    let winning: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl > 0.0).collect();
    let losing: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl <= 0.0).collect();

    let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
    let gross_profit: f64 = winning.iter().map(|t| t.pnl).sum();
    let gross_loss: f64 = losing.iter().map(|t| t.pnl.abs()).sum();

    let profit_factor = if gross_loss > 0.0 {
        Some(gross_profit / gross_loss)
    } else {
        None
    };

    let max_drawdown = drawdown_curve.iter().cloned().fold(0.0, f64::max);
    let max_drawdown_percent = {
        // Percent against the peak preceding the deepest trough.
        let mut peak = f64::MIN;
        let mut worst = 0.0f64;
        for &equity in &equity_curve {
            peak = peak.max(equity);
            if peak > 0.0 {
                worst = worst.max((peak - equity) / peak * 100.0);
            }
        }
        worst
    };

    BacktestResults {
        total_trades,
        winning_trades: winning.len(),
        losing_trades: losing.len(),
        win_rate: if total_trades > 0 {
            winning.len() as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        },
        total_pnl,
        average_pnl: if total_trades > 0 {
            total_pnl / total_trades as f64
        } else {
            0.0
        },
        largest_win: winning.iter().map(|t| t.pnl).fold(0.0, f64::max),
        largest_loss: losing.iter().map(|t| t.pnl).fold(0.0, f64::min),
        profit_factor,
        max_drawdown,
        max_drawdown_percent,
        average_duration_secs: if total_trades > 0 {
            trades.iter().map(|t| t.duration_secs as f64).sum::<f64>() / total_trades as f64
        } else {
            0.0
        },
        total_commission: trades.iter().map(|t| t.commission).sum(),
        ending_capital,
        equity_curve,
        drawdown_curve,
        trades,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{ConditionSpec, ConditionType, IndicatorSpec, LogicalOperator};
    use crate::indicators::{IndicatorKind, ParamBag};
    use crate::market::series::Bar;
    use crate::types::{ConditionSide, Side};
    use chrono::TimeZone;

    fn series_of_closes(symbol: &str, closes: &[f64]) -> Series {
        let mut s = Series::new(symbol);
        for (i, &c) in closes.iter().enumerate() {
            s.append(Bar {
                timestamp: Utc.timestamp_opt(1_750_000_020 + i as i64 * 60, 0).unwrap(),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 10,
            })
            .unwrap();
        }
        s
    }

    fn params(entries: &[(&str, serde_json::Value)]) -> ParamBag {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// S1-style SMA crossover algorithm: fast(3) over slow(10).
    fn sma_crossover_algorithm() -> Arc<Algorithm> {
        let algo = Algorithm {
            name: "sma-cross".into(),
            description: String::new(),
            version: "1".into(),
            indicators: vec![
                IndicatorSpec {
                    name: "SMA_Fast".into(),
                    kind: IndicatorKind::Sma,
                    parameters: params(&[("period", serde_json::json!(3))]),
                    description: String::new(),
                },
                IndicatorSpec {
                    name: "SMA_Slow".into(),
                    kind: IndicatorKind::Sma,
                    parameters: params(&[("period", serde_json::json!(10))]),
                    description: String::new(),
                },
            ],
            entry_conditions: vec![ConditionSpec {
                kind: ConditionType::Crossover,
                side: ConditionSide::Long,
                symmetric: false,
                parameters: params(&[
                    ("indicator1", serde_json::json!("SMA_Fast")),
                    ("indicator2", serde_json::json!("SMA_Slow")),
                    ("direction", serde_json::json!("above")),
                ]),
                logical_operator: LogicalOperator::And,
            }],
            exit_conditions: vec![ConditionSpec {
                kind: ConditionType::Crossover,
                side: ConditionSide::Both,
                symmetric: false,
                parameters: params(&[
                    ("indicator1", serde_json::json!("SMA_Fast")),
                    ("indicator2", serde_json::json!("SMA_Slow")),
                    ("direction", serde_json::json!("below")),
                ]),
                logical_operator: LogicalOperator::And,
            }],
            created_time: Utc::now(),
            last_modified_time: Utc::now(),
            favorite: false,
        };
        algo.validate().unwrap();
        Arc::new(algo)
    }

    /// Decline through warmup, then rally: the fast average crosses above the
    /// slow one exactly once, after both are defined.
    fn crossing_closes() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..13).map(|i| 22.0 - i as f64).collect(); // 22..10
        closes.extend([13.0, 16.0, 19.0, 22.0, 25.0]);
        closes
    }

    fn definition(symbol: &str) -> BacktestDefinition {
        BacktestDefinition {
            id: Uuid::new_v4().to_string(),
            name: "cross-test".into(),
            symbol: symbol.into(),
            algorithm_name: "sma-cross".into(),
            start_date: Utc.timestamp_opt(1_750_000_000, 0).unwrap(),
            end_date: Utc.timestamp_opt(1_750_100_000, 0).unwrap(),
            lag_ticks: 0,
            created_at: Utc::now(),
            last_modified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sma_crossover_long_entry() {
        let events = EventBus::default();
        let executor = BacktestExecutor::new(events);
        let def = definition("ES");
        let run_id = executor.create(&def, 10_000.0, 0.0);

        let series = series_of_closes("ES", &crossing_closes());
        let results = executor
            .run(&run_id, sma_crossover_algorithm(), series)
            .await
            .unwrap();

        // Exactly one LONG round trip, closed at end of data (no down-cross).
        assert_eq!(results.total_trades, 1);
        let trade = &results.trades[0];
        assert_eq!(trade.side, Side::Long);
        assert_eq!(trade.exit_signal, "end of data");
        // Entry at the cross bar's close (19.0), exit at the final close (25.0).
        assert!((trade.entry_price - 19.0).abs() < 1e-9);
        assert!((trade.exit_price - 25.0).abs() < 1e-9);
        // 6 points * $50 (ES) = 300.
        assert!((results.total_pnl - 300.0).abs() < 1e-9);

        let snapshot = executor.get(&run_id).unwrap();
        assert_eq!(snapshot.status, BacktestStatus::Completed);
        assert!((snapshot.progress - 100.0).abs() < 1e-9);
    }

    fn rsi_reversal_algorithm() -> Arc<Algorithm> {
        let algo = Algorithm {
            name: "rsi-reversal".into(),
            description: String::new(),
            version: "1".into(),
            indicators: vec![IndicatorSpec {
                name: "RSI_14".into(),
                kind: IndicatorKind::Rsi,
                parameters: params(&[("period", serde_json::json!(14))]),
                description: String::new(),
            }],
            entry_conditions: vec![ConditionSpec {
                kind: ConditionType::Threshold,
                side: ConditionSide::Long,
                symmetric: false,
                parameters: params(&[
                    ("indicator", serde_json::json!("RSI_14")),
                    ("comparison", serde_json::json!("<")),
                    ("threshold", serde_json::json!(30)),
                ]),
                logical_operator: LogicalOperator::And,
            }],
            exit_conditions: vec![ConditionSpec {
                kind: ConditionType::Threshold,
                side: ConditionSide::Both,
                symmetric: false,
                parameters: params(&[
                    ("indicator", serde_json::json!("RSI_14")),
                    ("comparison", serde_json::json!(">")),
                    ("threshold", serde_json::json!(50)),
                ]),
                logical_operator: LogicalOperator::And,
            }],
            created_time: Utc::now(),
            last_modified_time: Utc::now(),
            favorite: false,
        };
        algo.validate().unwrap();
        Arc::new(algo)
    }

    #[tokio::test]
    async fn rsi_oversold_round_trip() {
        // A steady sell-off pins RSI at 0 (oversold entry); the rally that
        // follows lifts it through 50 (exit) for a profitable long.
        let executor = BacktestExecutor::new(EventBus::default());
        let def = definition("ES");
        let run_id = executor.create(&def, 10_000.0, 0.0);

        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect(); // 100..81
        closes.extend((1..=15).map(|i| 81.0 + 2.0 * i as f64)); // rally to 111

        let results = executor
            .run(&run_id, rsi_reversal_algorithm(), series_of_closes("ES", &closes))
            .await
            .unwrap();

        assert_eq!(results.total_trades, 1);
        let trade = &results.trades[0];
        assert_eq!(trade.side, Side::Long);
        // Entry at the first bar where RSI(14) is defined and oversold.
        assert!((trade.entry_price - 86.0).abs() < 1e-9);
        assert!(trade.exit_price > trade.entry_price);
        assert!(trade.pnl > 0.0, "oversold long should profit: {}", trade.pnl);
        assert!(trade.exit_signal.contains("> 50"));
        assert_eq!(results.winning_trades, 1);
        assert!((results.win_rate - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn backtest_determinism() {
        // S5: identical inputs produce identical trades and results.
        let events = EventBus::default();
        let executor = BacktestExecutor::new(events);
        let algorithm = sma_crossover_algorithm();

        // A longer, wavier series with several crossings.
        let closes: Vec<f64> = (0..500)
            .map(|i| 4500.0 + ((i as f64) * 0.21).sin() * 12.0 + ((i as f64) * 0.043).cos() * 25.0)
            .collect();

        let def = definition("ES");
        let run_a = executor.create(&def, 25_000.0, 2.0);
        let run_b = executor.create(&def, 25_000.0, 2.0);

        let results_a = executor
            .run(&run_a, algorithm.clone(), series_of_closes("ES", &closes))
            .await
            .unwrap();
        let results_b = executor
            .run(&run_b, algorithm, series_of_closes("ES", &closes))
            .await
            .unwrap();

        assert!(results_a.total_trades > 1, "fixture should actually trade");
        assert_eq!(results_a.total_trades, results_b.total_trades);
        assert_eq!(results_a.total_pnl, results_b.total_pnl);
        assert_eq!(results_a.max_drawdown, results_b.max_drawdown);
        assert_eq!(results_a.equity_curve, results_b.equity_curve);
        assert_eq!(results_a.drawdown_curve, results_b.drawdown_curve);
        for (a, b) in results_a.trades.iter().zip(results_b.trades.iter()) {
            assert_eq!(a.entry_price, b.entry_price);
            assert_eq!(a.exit_price, b.exit_price);
            assert_eq!(a.pnl, b.pnl);
            assert_eq!(a.entry_time, b.entry_time);
        }
    }

    #[tokio::test]
    async fn equity_and_drawdown_accounting() {
        let events = EventBus::default();
        let executor = BacktestExecutor::new(events);
        let def = definition("ES");
        let run_id = executor.create(&def, 10_000.0, 2.0);

        let closes: Vec<f64> = (0..300)
            .map(|i| 4500.0 + ((i as f64) * 0.3).sin() * 20.0)
            .collect();
        let results = executor
            .run(&run_id, sma_crossover_algorithm(), series_of_closes("ES", &closes))
            .await
            .unwrap();

        assert_eq!(results.equity_curve.len(), results.total_trades + 1);
        assert_eq!(results.drawdown_curve.len(), results.equity_curve.len());
        assert_eq!(results.equity_curve[0], 10_000.0);
        assert_eq!(
            *results.equity_curve.last().unwrap(),
            results.ending_capital
        );
        assert!((results.total_pnl - (results.ending_capital - 10_000.0)).abs() < 1e-6);
        assert!(results.max_drawdown >= 0.0);
        assert!(results.total_commission >= results.total_trades as f64 * 2.0 - 1e-9);

        // Win/loss bookkeeping adds up.
        assert_eq!(
            results.winning_trades + results.losing_trades,
            results.total_trades
        );
    }

    #[tokio::test]
    async fn cooperative_stop_breaks_the_loop() {
        let events = EventBus::default();
        let executor = Arc::new(BacktestExecutor::new(events));
        let def = definition("ES");
        let run_id = executor.create(&def, 10_000.0, 0.0);

        // Big enough that the run crosses many yield points.
        let closes: Vec<f64> = (0..200_000)
            .map(|i| 4500.0 + (i as f64 * 0.11).sin() * 15.0)
            .collect();
        let series = series_of_closes("ES", &closes);

        let task_executor = Arc::clone(&executor);
        let task_run_id = run_id.clone();
        let algorithm = sma_crossover_algorithm();
        let task = tokio::spawn(async move {
            task_executor.run(&task_run_id, algorithm, series).await
        });

        // Wait until the run is observably RUNNING, then request the stop.
        loop {
            tokio::task::yield_now().await;
            if executor
                .get(&run_id)
                .map(|s| s.status == BacktestStatus::Running && s.progress > 0.0)
                .unwrap_or(false)
            {
                break;
            }
        }
        executor.stop(&run_id).unwrap();

        let results = task.await.unwrap().unwrap();
        let snapshot = executor.get(&run_id).unwrap();
        assert_eq!(snapshot.status, BacktestStatus::Stopped);
        assert!(
            snapshot.progress < 100.0,
            "stop should land before the end, got {}",
            snapshot.progress
        );
        // Partial results are still computed and attached.
        assert!(snapshot.results.is_some());
        assert_eq!(
            snapshot.results.unwrap().total_trades,
            results.total_trades
        );
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let executor = BacktestExecutor::new(EventBus::default());
        assert_eq!(
            executor.stop("nope").unwrap_err().code(),
            "NOT_FOUND"
        );
        assert_eq!(
            executor.delete("nope").unwrap_err().code(),
            "NOT_FOUND"
        );
        assert!(executor.get("nope").is_none());
    }

    #[tokio::test]
    async fn delete_removes_run() {
        let executor = BacktestExecutor::new(EventBus::default());
        let def = definition("ES");
        let run_id = executor.create(&def, 10_000.0, 0.0);
        assert!(executor.get(&run_id).is_some());
        executor.delete(&run_id).unwrap();
        assert!(executor.get(&run_id).is_none());
    }

    #[tokio::test]
    async fn progress_events_are_published() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let executor = BacktestExecutor::new(events);
        let def = definition("ES");
        let run_id = executor.create(&def, 10_000.0, 0.0);

        let closes: Vec<f64> = (0..250).map(|i| 100.0 + (i as f64 * 0.2).sin()).collect();
        executor
            .run(&run_id, sma_crossover_algorithm(), series_of_closes("ES", &closes))
            .await
            .unwrap();

        let mut saw_progress = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::BacktestUpdate { status, progress, .. } = event {
                if status == BacktestStatus::Running && progress > 0.0 {
                    saw_progress = true;
                }
                if status == BacktestStatus::Completed {
                    saw_completed = true;
                }
            }
        }
        assert!(saw_progress, "expected intermediate progress events");
        assert!(saw_completed, "expected a completion event");
    }

    #[tokio::test]
    async fn serde_round_trip_definition() {
        let def = definition("ENQ");
        let json = serde_json::to_string(&def).unwrap();
        let back: BacktestDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(def, back);
        assert!(json.contains("algorithmName"));
        assert!(json.contains("lagTicks"));
    }
}
