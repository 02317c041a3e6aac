// =============================================================================
// Live instance runtime — one task per (symbol, algorithm, account) binding
// =============================================================================
//
// Pipeline per trade batch, while RUNNING:
//   trades -> bar builder -> series -> indicator recompute -> condition
//   engine -> position state machine -> signals / orders -> events.
//
// Failure policy: errors inside trade handling are logged to the instance
// ring buffer and do not change status; repeated Transient broker failures
// escalate to Permanent, which stops the instance with `last_error`. An
// Internal error (violated invariant) stops this instance and leaves every
// other instance untouched.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::algorithm::Algorithm;
use crate::broker::subscriptions::{SubscriptionHub, TradeSubscription};
use crate::broker::{MarketBroker, OrderRequest, OrderType, TradeTick};
use crate::conditions::{evaluate_entry, evaluate_exit};
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus, Signal};
use crate::indicators;
use crate::market::bars::BarBuilder;
use crate::market::series::{Bar, Series};
use crate::position::{ClosedTrade, Position, TradeTotals};
use crate::types::{tick_spec, InstanceStatus, Side, SignalKind, TickSpec};

/// Contracts per entry. Position sizing beyond a single contract is a
/// account-risk concern the engine does not model.
const ENTRY_QUANTITY: u32 = 1;
/// Instance log ring capacity.
const MAX_LOG_LINES: usize = 1000;
/// Consecutive Transient failures before escalation to Permanent.
const TRANSIENT_ESCALATION_THRESHOLD: u32 = 5;
/// Historical backfill window on first start.
const HISTORY_BACKFILL_DAYS: i64 = 7;
/// Minimum bars before indicators are computed and conditions evaluated.
const INDICATOR_WARMUP_BARS: usize = 20;
/// How long `stop` waits for the task to observe cancellation.
const STOP_GRACE_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Configuration and state snapshot
// ---------------------------------------------------------------------------

/// Persisted definition of an instance (the document in `instances.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub contract_id: String,
    pub account_id: String,
    pub algorithm_name: String,
    #[serde(default = "default_simulation_mode")]
    pub simulation_mode: bool,
    #[serde(default = "default_starting_capital")]
    pub starting_capital: f64,
    #[serde(default)]
    pub commission: f64,
}

fn default_simulation_mode() -> bool {
    true
}

fn default_starting_capital() -> f64 {
    10_000.0
}

impl InstanceConfig {
    /// Allocate a fresh id for a new instance definition.
    pub fn with_new_id(mut self) -> Self {
        self.id = Uuid::new_v4().to_string();
        self
    }
}

/// Read snapshot of an instance, served to the API and the event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceState {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub contract_id: String,
    pub account_id: String,
    pub algorithm_name: String,
    pub status: InstanceStatus,
    pub simulation_mode: bool,
    pub starting_capital: f64,
    pub commission: f64,
    pub tick_size: f64,
    pub tick_value: f64,
    pub position: Position,
    pub totals: TradeTotals,
    pub unrealized_pnl: f64,
    pub current_price: f64,
    pub bar_count: usize,
    pub current_bar: Option<Bar>,
    pub last_signal_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl InstanceState {
    /// Whether the fields the 1-second poll watches differ between snapshots.
    pub fn poll_changed(&self, other: &Self) -> bool {
        self.status != other.status
            || self.totals != other.totals
            || self.unrealized_pnl != other.unrealized_pnl
            || self.current_price != other.current_price
            || self.position != other.position
            || self.bar_count != other.bar_count
    }
}

/// Chart payload: bars plus every stored indicator sequence, tail-aligned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub bars: Vec<Bar>,
    pub indicators: std::collections::HashMap<String, Vec<f64>>,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

struct Inner {
    status: InstanceStatus,
    series: Series,
    bar_builder: BarBuilder,
    position: Position,
    entry_signal: String,
    totals: TradeTotals,
    trades: Vec<ClosedTrade>,
    logs: VecDeque<String>,
    current_price: f64,
    last_signal_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    transient_failures: u32,
}

pub struct InstanceRuntime {
    config: RwLock<InstanceConfig>,
    algorithm: RwLock<Option<Arc<Algorithm>>>,
    broker: Arc<dyn MarketBroker>,
    hub: SubscriptionHub,
    events: EventBus,
    inner: RwLock<Inner>,
    subscription: tokio::sync::Mutex<Option<TradeSubscription>>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl InstanceRuntime {
    pub fn new(
        config: InstanceConfig,
        algorithm: Option<Arc<Algorithm>>,
        broker: Arc<dyn MarketBroker>,
        hub: SubscriptionHub,
        events: EventBus,
    ) -> Self {
        let series = Series::new(config.contract_id.clone());
        Self {
            config: RwLock::new(config),
            algorithm: RwLock::new(algorithm),
            broker,
            hub,
            events,
            inner: RwLock::new(Inner {
                status: InstanceStatus::Stopped,
                series,
                bar_builder: BarBuilder::new(),
                position: Position::flat(),
                entry_signal: String::new(),
                totals: TradeTotals::default(),
                trades: Vec::new(),
                logs: VecDeque::new(),
                current_price: 0.0,
                last_signal_time: None,
                last_error: None,
                transient_failures: 0,
            }),
            subscription: tokio::sync::Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> String {
        self.config.read().id.clone()
    }

    pub fn contract_id(&self) -> String {
        self.config.read().contract_id.clone()
    }

    pub fn config(&self) -> InstanceConfig {
        self.config.read().clone()
    }

    pub fn status(&self) -> InstanceStatus {
        self.inner.read().status
    }

    fn tick(&self) -> TickSpec {
        tick_spec(&self.config.read().symbol)
    }

    pub fn set_algorithm(&self, algorithm: Arc<Algorithm>) {
        let mut config = self.config.write();
        config.algorithm_name = algorithm.name.clone();
        *self.algorithm.write() = Some(algorithm);
    }

    /// Replace the definition (only meaningful while STOPPED; the manager
    /// enforces that).
    pub fn apply_config(&self, config: InstanceConfig) {
        let contract_changed = {
            let current = self.config.read();
            current.contract_id != config.contract_id
        };
        let contract = config.contract_id.clone();
        *self.config.write() = config;
        if contract_changed {
            // A new contract invalidates the accumulated series.
            let mut inner = self.inner.write();
            inner.series = Series::new(contract);
            inner.bar_builder = BarBuilder::new();
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub async fn start(self: Arc<Self>) -> EngineResult<()> {
        match self.status() {
            InstanceStatus::Running => {
                return Err(EngineError::Conflict("instance is already running".into()))
            }
            InstanceStatus::Paused => {
                return Err(EngineError::Conflict(
                    "instance is paused — resume it instead".into(),
                ))
            }
            InstanceStatus::Stopped => {}
        }

        if self.algorithm.read().is_none() {
            return Err(EngineError::Validation(
                "instance has no algorithm bound".into(),
            ));
        }

        // Backfill history so indicators have warmup data immediately.
        if self.inner.read().series.is_empty() {
            self.backfill_history().await?;
        }

        let contract_id = self.contract_id();
        let (subscription, rx) = self.hub.subscribe(&contract_id).await?;
        *self.subscription.lock().await = Some(subscription);

        {
            let mut inner = self.inner.write();
            inner.status = InstanceStatus::Running;
            inner.last_error = None;
            inner.transient_failures = 0;
        }
        self.log(format!("started on {contract_id}"));
        self.emit_state_changed();

        let runtime = Arc::clone(&self);
        let task = tokio::spawn(async move { runtime.run_loop(rx).await });
        *self.task.lock().await = Some(task);

        Ok(())
    }

    pub fn pause(&self) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if inner.status != InstanceStatus::Running {
            return Err(EngineError::Conflict(format!(
                "cannot pause instance in status {}",
                inner.status
            )));
        }
        inner.status = InstanceStatus::Paused;
        drop(inner);
        self.log("paused".to_string());
        self.emit_state_changed();
        Ok(())
    }

    pub fn resume(&self) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if inner.status != InstanceStatus::Paused {
            return Err(EngineError::Conflict(format!(
                "cannot resume instance in status {}",
                inner.status
            )));
        }
        inner.status = InstanceStatus::Running;
        drop(inner);
        self.log("resumed".to_string());
        self.emit_state_changed();
        Ok(())
    }

    /// Stop the runtime. Idempotent: stopping a STOPPED instance succeeds
    /// without side effects. Series and totals are preserved.
    pub async fn stop(&self) -> EngineResult<()> {
        if self.status() == InstanceStatus::Stopped {
            return Ok(());
        }

        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.close().await;
        }

        self.inner.write().status = InstanceStatus::Stopped;

        // Wait (bounded) for the task to observe the closed stream and exit.
        if let Some(task) = self.task.lock().await.take() {
            let grace = std::time::Duration::from_secs(STOP_GRACE_SECS);
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!(instance = %self.id(), "runtime task did not exit within grace period");
            }
        }

        self.log("stopped".to_string());
        self.emit_state_changed();
        Ok(())
    }

    /// Terminal teardown: stop and release the market subscription.
    pub async fn dispose(&self) {
        let _ = self.stop().await;
    }

    async fn backfill_history(&self) -> EngineResult<()> {
        let contract_id = self.contract_id();
        let end = Utc::now();
        let start = end - Duration::days(HISTORY_BACKFILL_DAYS);

        let bars = self
            .broker
            .get_historical_bars(&contract_id, start, end)
            .await?;

        let instance_id = self.id();
        let mut inner = self.inner.write();
        let mut loaded = 0usize;
        for bar in bars {
            match inner.series.append(bar) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(instance = %instance_id, error = %e, "historical bar rejected"),
            }
        }
        if let Some(last) = inner.series.get_last() {
            inner.current_price = last.close;
        }
        {
            let Inner {
                ref series,
                ref mut bar_builder,
                ..
            } = *inner;
            bar_builder.resync(series);
        }
        drop(inner);

        self.log(format!("loaded {loaded} historical bars"));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trade processing
    // -------------------------------------------------------------------------

    async fn run_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<TradeTick>>) {
        info!(instance = %self.id(), "runtime task started");
        while let Some(batch) = rx.recv().await {
            Self::process_batch(&self, batch).await;
            if self.status() == InstanceStatus::Stopped {
                break;
            }
        }
        info!(instance = %self.id(), "runtime task ended");
    }

    async fn process_batch(this: &Arc<Self>, batch: Vec<TradeTick>) {
        if this.status() != InstanceStatus::Running {
            return; // PAUSED drops batches; STOPPED is about to exit.
        }

        let orders = match this.handle_batch(&batch) {
            Ok(orders) => orders,
            Err(EngineError::Internal(msg)) => {
                // Invariant violation: stop this instance, leave others alone.
                error!(instance = %this.id(), error = %msg, "internal error — stopping instance");
                this.inner.write().last_error = Some(msg.clone());
                this.log(format!("internal error: {msg}"));
                let runtime = Arc::clone(this);
                tokio::spawn(async move {
                    let _ = runtime.stop().await;
                });
                return;
            }
            Err(e) => {
                this.log(format!("trade handling error: {e}"));
                return;
            }
        };

        for order in orders {
            match this.broker.place_order(order).await {
                Ok(result) if result.success => {
                    this.inner.write().transient_failures = 0;
                    this.log(format!(
                        "order accepted (id {})",
                        result.order_id.unwrap_or_else(|| "?".into())
                    ));
                }
                Ok(result) => {
                    this.log(format!(
                        "order rejected: {}",
                        result.error.unwrap_or_else(|| "unknown".into())
                    ));
                }
                Err(e) => Self::record_broker_failure(this, e.into()),
            }
        }
    }

    /// Synchronous core of the pipeline. Returns the market orders to submit
    /// (empty in simulation mode).
    fn handle_batch(&self, batch: &[TradeTick]) -> EngineResult<Vec<OrderRequest>> {
        let config = self.config();
        let algorithm = self
            .algorithm
            .read()
            .clone()
            .ok_or_else(|| EngineError::Validation("no algorithm bound".into()))?;
        let tick = self.tick();

        let mut inner = self.inner.write();
        let mut any_new_bar = false;

        for trade in batch {
            let Inner {
                ref mut series,
                ref mut bar_builder,
                ref mut current_price,
                ..
            } = *inner;
            let update = bar_builder.apply(series, trade)?;
            if update.dropped {
                continue;
            }
            any_new_bar |= update.is_new_bar;
            *current_price = trade.price;
        }

        let count = inner.series.count();
        if count == 0 {
            return Ok(Vec::new());
        }

        // Data update precedes any signal derived from the same bar.
        if let Some(bar) = inner.series.get_last() {
            self.events.publish(EngineEvent::InstanceDataUpdate {
                instance_id: config.id.clone(),
                bar,
                is_new_bar: any_new_bar,
            });
        }

        if count < INDICATOR_WARMUP_BARS {
            return Ok(Vec::new());
        }

        {
            let Inner { ref mut series, .. } = *inner;
            indicators::compute_all(series, &algorithm.indicators)?;
        }

        let i = count - 1;
        let price = inner.current_price;
        let now = Utc::now();
        let mut orders = Vec::new();

        if inner.position.is_flat() {
            let entry = evaluate_entry(&inner.series, &algorithm.entry_conditions, i);
            if let Some((side, text)) = entry.decision() {
                let text = text.to_string();
                inner.position = Position::open(side, ENTRY_QUANTITY, price, now);
                inner.entry_signal = text.clone();
                inner.last_signal_time = Some(now);

                let signal = Signal {
                    kind: SignalKind::Entry,
                    side,
                    price,
                    timestamp: now,
                    text: text.clone(),
                };
                drop(inner);

                self.log(format!("ENTRY {side} @ {price} — {text}"));
                self.events.publish(EngineEvent::InstanceSignal {
                    instance_id: config.id.clone(),
                    signal,
                });

                if !config.simulation_mode {
                    orders.push(OrderRequest {
                        account_id: config.account_id.clone(),
                        contract_id: config.contract_id.clone(),
                        side,
                        quantity: ENTRY_QUANTITY,
                        order_type: OrderType::Market,
                        custom_tag: Some(format!("meridian:{}", config.id)),
                    });
                }
                return Ok(orders);
            }
        } else {
            let exit_text = evaluate_exit(
                &inner.series,
                &algorithm.exit_conditions,
                i,
                &inner.position,
                price,
                tick,
            );
            if let Some(text) = exit_text {
                let closed_side = inner.position.side;
                let entry_signal = std::mem::take(&mut inner.entry_signal);
                let Some(trade) = inner.position.close(
                    price,
                    now,
                    config.commission,
                    tick,
                    entry_signal,
                    text.clone(),
                ) else {
                    return Err(EngineError::Internal(
                        "exit fired for a flat position".into(),
                    ));
                };

                inner.totals.record(&trade);
                let pnl = trade.pnl;
                inner.trades.push(trade);
                inner.last_signal_time = Some(now);

                let signal = Signal {
                    kind: SignalKind::Exit,
                    side: closed_side,
                    price,
                    timestamp: now,
                    text: text.clone(),
                };
                drop(inner);

                self.log(format!(
                    "EXIT {closed_side} @ {price} (P&L {pnl:.2}) — {text}"
                ));
                self.events.publish(EngineEvent::InstanceSignal {
                    instance_id: config.id.clone(),
                    signal,
                });

                if !config.simulation_mode {
                    let closing_side = match closed_side {
                        Side::Long => Side::Short,
                        Side::Short => Side::Long,
                        Side::None => {
                            return Err(EngineError::Internal(
                                "closing order for a flat position".into(),
                            ))
                        }
                    };
                    orders.push(OrderRequest {
                        account_id: config.account_id.clone(),
                        contract_id: config.contract_id.clone(),
                        side: closing_side,
                        quantity: ENTRY_QUANTITY,
                        order_type: OrderType::Market,
                        custom_tag: Some(format!("meridian:{}", config.id)),
                    });
                }
                return Ok(orders);
            }
        }

        Ok(orders)
    }

    fn record_broker_failure(this: &Arc<Self>, err: EngineError) {
        // Config is always locked before `inner` to keep lock order uniform.
        let name = this.config.read().name.clone();
        let escalate = {
            let mut inner = this.inner.write();
            match err {
                EngineError::Transient(ref msg) => {
                    inner.transient_failures += 1;
                    let attempt = inner.transient_failures;
                    self_log(
                        &mut inner,
                        &name,
                        format!(
                            "transient broker error ({attempt}/{TRANSIENT_ESCALATION_THRESHOLD}): {msg}"
                        ),
                    );
                    if attempt >= TRANSIENT_ESCALATION_THRESHOLD {
                        inner.last_error =
                            Some(format!("repeated transient failures: {msg}"));
                        true
                    } else {
                        false
                    }
                }
                ref other => {
                    inner.last_error = Some(other.to_string());
                    self_log(&mut inner, &name, format!("broker error: {other}"));
                    matches!(other, EngineError::Permanent(_))
                }
            }
        };

        if escalate {
            warn!(instance = %this.id(), "broker failures escalated — stopping instance");
            // Stop from a separate task: the runtime task itself cannot
            // await its own join handle.
            let runtime = Arc::clone(this);
            tokio::spawn(async move {
                let _ = runtime.stop().await;
            });
        }
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn get_state(&self) -> InstanceState {
        let config = self.config.read().clone();
        let tick = tick_spec(&config.symbol);
        let inner = self.inner.read();

        InstanceState {
            id: config.id,
            name: config.name,
            symbol: config.symbol,
            contract_id: config.contract_id,
            account_id: config.account_id,
            algorithm_name: config.algorithm_name,
            status: inner.status,
            simulation_mode: config.simulation_mode,
            starting_capital: config.starting_capital,
            commission: config.commission,
            tick_size: tick.tick_size,
            tick_value: tick.tick_value,
            position: inner.position,
            totals: inner.totals,
            unrealized_pnl: inner.position.unrealized_pnl(inner.current_price, tick),
            current_price: inner.current_price,
            bar_count: inner.series.count(),
            current_bar: inner.series.get_last(),
            last_signal_time: inner.last_signal_time,
            last_error: inner.last_error.clone(),
        }
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.read().logs.iter().cloned().collect()
    }

    pub fn trades(&self) -> Vec<ClosedTrade> {
        self.inner.read().trades.clone()
    }

    /// Bars and indicator sequences for charting, limited to the most recent
    /// `limit` bars.
    pub fn chart_data(&self, limit: usize) -> ChartData {
        let inner = self.inner.read();
        let count = inner.series.count();
        let lo = count.saturating_sub(limit);

        let bars = inner.series.slice(lo, count);
        let indicators = inner
            .series
            .indicator_names()
            .into_iter()
            .filter_map(|name| {
                inner
                    .series
                    .get_indicator(&name)
                    .map(|seq| (name, seq[lo..].to_vec()))
            })
            .collect();

        ChartData { bars, indicators }
    }

    // -------------------------------------------------------------------------
    // Logging / events
    // -------------------------------------------------------------------------

    fn log(&self, message: String) {
        let name = self.config.read().name.clone();
        let mut inner = self.inner.write();
        self_log(&mut inner, &name, message.clone());
        drop(inner);

        self.events.publish(EngineEvent::InstanceLog {
            instance_id: self.id(),
            line: message,
        });
    }

    fn emit_state_changed(&self) {
        let state = self.get_state();
        if let Ok(value) = serde_json::to_value(&state) {
            self.events.publish(EngineEvent::InstanceStateChanged {
                instance_id: state.id.clone(),
                state: value,
            });
        }
    }
}

/// Append a timestamped line to the bounded instance log ring.
fn self_log(inner: &mut Inner, name: &str, message: String) {
    let line = format!("{} [{name}] {message}", Utc::now().to_rfc3339());
    info!(instance = %name, "{message}");
    inner.logs.push_back(line);
    while inner.logs.len() > MAX_LOG_LINES {
        inner.logs.pop_front();
    }
}
