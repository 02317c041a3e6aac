// =============================================================================
// REST API — Axum 0.7
// =============================================================================
//
// Every response is `{ "success": true, ... }` or
// `{ "success": false, "error": ..., "code": ... }`; engine errors map onto
// stable codes and HTTP statuses through the `EngineError` taxonomy. The
// server binds loopback only, so there is no request authentication.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::algorithm::Algorithm;
use crate::api::ApiState;
use crate::backtest::BacktestDefinition;
use crate::errors::{EngineError, EngineResult};
use crate::manager::InstancePatch;
use crate::market::series::{Bar, Series};
use crate::runtime::InstanceConfig;
use crate::types::BacktestStatus;

/// Default number of bars returned by chart-data.
const CHART_BARS_DEFAULT: usize = 500;

// =============================================================================
// Error envelope
// =============================================================================

#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "success": false,
            "error": self.0.to_string(),
            "code": self.0.code(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok(payload: serde_json::Value) -> ApiResult {
    let mut body = json!({ "success": true });
    if let (Some(obj), Some(extra)) = (body.as_object_mut(), payload.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    Ok(Json(body))
}

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Instances ───────────────────────────────────────────────
        .route("/instances", get(list_instances).post(create_instance))
        .route(
            "/instances/:id",
            get(get_instance).put(update_instance).delete(delete_instance),
        )
        .route("/instances/:id/start", post(start_instance))
        .route("/instances/:id/stop", post(stop_instance))
        .route("/instances/:id/pause", post(pause_instance))
        .route("/instances/:id/resume", post(resume_instance))
        .route("/instances/:id/state", get(instance_state))
        .route("/instances/:id/chart-data", get(instance_chart_data))
        .route("/instances/:id/logs", get(instance_logs))
        .route("/instances/:id/trades", get(instance_trades))
        // ── Algorithms ──────────────────────────────────────────────
        .route("/algorithms", get(list_algorithms).post(save_algorithm))
        .route("/algorithms/:name", delete(delete_algorithm))
        // ── Backtests ───────────────────────────────────────────────
        .route("/backtests", get(list_backtests).post(create_backtest))
        .route("/backtests/runs", get(list_backtest_runs))
        .route(
            "/backtests/runs/:run_id",
            get(get_backtest_run).delete(delete_backtest_run),
        )
        .route(
            "/backtests/:id",
            get(get_backtest).put(update_backtest).delete(delete_backtest),
        )
        .route("/backtests/:id/run", post(run_backtest))
        .route("/backtests/:id/stop", post(stop_backtest))
        .route("/backtests/:id/status", get(backtest_status))
        // ── Historical data ─────────────────────────────────────────
        .route(
            "/historical/:symbol",
            get(get_historical).post(upload_historical).delete(delete_historical),
        )
        // ── Trading / broker ────────────────────────────────────────
        .route("/trading/test-connection", post(test_connection))
        .route("/trading/subscribe-market-data", post(subscribe_market_data))
        .route(
            "/trading/unsubscribe-market-data",
            post(unsubscribe_market_data),
        )
        .route("/trading/accounts", get(trading_accounts))
        .route("/trading/contracts", get(trading_contracts))
        .route("/trading/historical-data", get(trading_historical_data))
        .route("/trading/status", get(trading_status))
        .route("/trading/server-status", get(trading_server_status))
        // ── Event stream ────────────────────────────────────────────
        .route("/events", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<ApiState>>) -> ApiResult {
    let (instance_count, running_instances) = state.manager.engine_counts();
    ok(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "engine": {
            "instanceCount": instance_count,
            "runningInstances": running_instances,
        },
    }))
}

// =============================================================================
// Instances
// =============================================================================

async fn list_instances(State(state): State<Arc<ApiState>>) -> ApiResult {
    ok(json!({ "instances": state.manager.get_all_states() }))
}

async fn create_instance(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<InstanceConfig>,
) -> ApiResult {
    let created = state.manager.create_instance(config, true)?;
    info!(instance = %created.id, name = %created.name, "instance created via API");
    ok(json!({ "instance": created }))
}

async fn get_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    ok(json!({ "instance": state.manager.get_state(&id)? }))
}

async fn update_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(patch): Json<InstancePatch>,
) -> ApiResult {
    ok(json!({ "instance": state.manager.update_instance(&id, patch)? }))
}

async fn delete_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.manager.delete_instance(&id).await?;
    ok(json!({}))
}

async fn start_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.manager.start_instance(&id).await?;
    ok(json!({ "status": state.manager.get_state(&id)?.status }))
}

async fn stop_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.manager.stop_instance(&id).await?;
    ok(json!({ "status": state.manager.get_state(&id)?.status }))
}

async fn pause_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.manager.pause_instance(&id)?;
    ok(json!({ "status": state.manager.get_state(&id)?.status }))
}

async fn resume_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.manager.resume_instance(&id)?;
    ok(json!({ "status": state.manager.get_state(&id)?.status }))
}

async fn instance_state(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    ok(json!({ "state": state.manager.get_state(&id)? }))
}

#[derive(Deserialize)]
struct ChartQuery {
    limit: Option<usize>,
}

async fn instance_chart_data(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<ChartQuery>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(CHART_BARS_DEFAULT);
    let chart = state.manager.instance_chart_data(&id, limit)?;
    ok(json!({ "chartData": chart }))
}

async fn instance_logs(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    ok(json!({ "logs": state.manager.instance_logs(&id)? }))
}

async fn instance_trades(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    ok(json!({ "trades": state.manager.instance_trades(&id)? }))
}

// =============================================================================
// Algorithms
// =============================================================================

async fn list_algorithms(State(state): State<Arc<ApiState>>) -> ApiResult {
    ok(json!({ "algorithms": state.manager.list_algorithms() }))
}

async fn save_algorithm(
    State(state): State<Arc<ApiState>>,
    Json(algorithm): Json<Algorithm>,
) -> ApiResult {
    let saved = state.manager.save_algorithm(algorithm)?;
    info!(name = %saved.name, "algorithm saved via API");
    ok(json!({ "algorithm": saved }))
}

async fn delete_algorithm(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult {
    state.manager.delete_algorithm(&name)?;
    ok(json!({}))
}

// =============================================================================
// Backtests
// =============================================================================

async fn list_backtests(State(state): State<Arc<ApiState>>) -> ApiResult {
    ok(json!({ "backtests": state.store.load_backtests() }))
}

async fn create_backtest(
    State(state): State<Arc<ApiState>>,
    Json(definition): Json<BacktestDefinition>,
) -> ApiResult {
    // The algorithm must exist up front; a missing one would otherwise only
    // surface when the run starts.
    state.manager.get_algorithm(&definition.algorithm_name)?;
    if definition.end_date <= definition.start_date {
        return Err(EngineError::Validation(
            "endDate must be after startDate".into(),
        )
        .into());
    }

    let definition = if definition.id.trim().is_empty() {
        definition.with_new_id()
    } else {
        definition
    };
    state.store.save_backtest(&definition)?;
    ok(json!({ "backtest": definition }))
}

fn load_definition(state: &ApiState, id: &str) -> EngineResult<BacktestDefinition> {
    state
        .store
        .load_backtest(id)
        .ok_or_else(|| EngineError::not_found("backtest", id))
}

async fn get_backtest(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    ok(json!({ "backtest": load_definition(&state, &id)? }))
}

async fn update_backtest(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(mut updated): Json<BacktestDefinition>,
) -> ApiResult {
    let existing = load_definition(&state, &id)?;
    state.manager.get_algorithm(&updated.algorithm_name)?;

    updated.id = existing.id;
    updated.created_at = existing.created_at;
    updated.last_modified_at = Utc::now();
    state.store.save_backtest(&updated)?;
    ok(json!({ "backtest": updated }))
}

async fn delete_backtest(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.store.delete_backtest(&id)?;
    ok(json!({}))
}

/// Assemble the series for a definition from stored historical day files.
///
/// Days missing from the store are fetched from the broker (the symbol is
/// used as the contract identifier) and cached as day files before the range
/// is assembled; a fetch failure leaves that day empty rather than failing
/// the whole run.
async fn build_backtest_series(
    state: &ApiState,
    definition: &BacktestDefinition,
) -> EngineResult<Series> {
    let start_day = definition.start_date.date_naive();
    let end_day = definition.end_date.date_naive();

    let mut date = start_day;
    while date <= end_day {
        if state
            .store
            .load_historical_day(&definition.symbol, date)
            .is_none()
        {
            let Some(day_start) = date.and_hms_opt(0, 0, 0) else {
                break;
            };
            let day_start = day_start.and_utc();
            let day_end = day_start + Duration::days(1);

            match state
                .manager
                .broker()
                .get_historical_bars(&definition.symbol, day_start, day_end)
                .await
            {
                Ok(bars) if !bars.is_empty() => {
                    info!(
                        symbol = %definition.symbol,
                        date = %date,
                        count = bars.len(),
                        "historical day fetched from broker and cached"
                    );
                    state.store.save_historical_day(&definition.symbol, date, &bars)?;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        symbol = %definition.symbol,
                        date = %date,
                        error = %e,
                        "historical day fetch failed — continuing without it"
                    );
                }
            }
        }
        let Some(next) = date.succ_opt() else { break };
        date = next;
    }

    let bars = state
        .store
        .load_historical_range(&definition.symbol, start_day, end_day);

    let mut series = Series::new(definition.symbol.clone());
    for bar in bars {
        if bar.timestamp < definition.start_date || bar.timestamp >= definition.end_date {
            continue;
        }
        series.append(bar)?;
    }

    if series.is_empty() {
        return Err(EngineError::Validation(format!(
            "no historical data for {} in the requested range",
            definition.symbol
        )));
    }
    Ok(series)
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RunBacktestRequest {
    starting_capital: Option<f64>,
    commission: Option<f64>,
}

async fn run_backtest(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Option<Json<RunBacktestRequest>>,
) -> ApiResult {
    let definition = load_definition(&state, &id)?;
    let algorithm = state.manager.get_algorithm(&definition.algorithm_name)?;
    let series = build_backtest_series(&state, &definition).await?;

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let run_id = state.executor.create(
        &definition,
        request.starting_capital.unwrap_or(10_000.0),
        request.commission.unwrap_or(0.0),
    );
    info!(backtest = %id, run = %run_id, bars = series.count(), "backtest run starting");

    let executor = Arc::clone(&state.executor);
    let store = Arc::clone(&state.store);
    let task_run_id = run_id.clone();
    tokio::spawn(async move {
        let _ = executor.run(&task_run_id, algorithm, series).await;
        // Persist the finished snapshot set (completed, failed, stopped).
        let finished: Vec<_> = executor
            .list()
            .into_iter()
            .filter(|r| r.status != BacktestStatus::Running && r.status != BacktestStatus::Created)
            .collect();
        if let Err(e) = store.save_backtest_results(&finished) {
            warn!(error = %e, "failed to persist backtest results");
        }
    });

    ok(json!({ "runId": run_id }))
}

async fn stop_backtest(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    // Stop every active run of this definition.
    let mut stopped = Vec::new();
    for run in state.executor.list() {
        if run.definition_id == id && run.status == BacktestStatus::Running {
            state.executor.stop(&run.id)?;
            stopped.push(run.id);
        }
    }
    ok(json!({ "stoppedRuns": stopped }))
}

async fn backtest_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let runs: Vec<_> = state
        .executor
        .list()
        .into_iter()
        .filter(|r| r.definition_id == id)
        .collect();
    if runs.is_empty() {
        // Definitions with no in-process runs still answer from persistence.
        load_definition(&state, &id)?;
    }
    ok(json!({ "runs": runs }))
}

async fn list_backtest_runs(State(state): State<Arc<ApiState>>) -> ApiResult {
    // In-process runs first, then persisted results from earlier sessions.
    let live = state.executor.list();
    let mut runs = live.clone();
    for persisted in state.store.load_backtest_results() {
        if !live.iter().any(|r| r.id == persisted.id) {
            runs.push(persisted);
        }
    }
    ok(json!({ "runs": runs }))
}

async fn get_backtest_run(
    State(state): State<Arc<ApiState>>,
    Path(run_id): Path<String>,
) -> ApiResult {
    let run = state.executor.get(&run_id).or_else(|| {
        state
            .store
            .load_backtest_results()
            .into_iter()
            .find(|r| r.id == run_id)
    });
    let run = run.ok_or_else(|| EngineError::not_found("backtest run", &run_id))?;
    ok(json!({ "run": run }))
}

async fn delete_backtest_run(
    State(state): State<Arc<ApiState>>,
    Path(run_id): Path<String>,
) -> ApiResult {
    match state.executor.delete(&run_id) {
        Ok(()) => {}
        Err(EngineError::NotFound { .. }) => {
            // Not in-process: fall back to the persisted result set.
            let mut persisted = state.store.load_backtest_results();
            let before = persisted.len();
            persisted.retain(|r| r.id != run_id);
            if persisted.len() == before {
                return Err(EngineError::not_found("backtest run", &run_id).into());
            }
            state.store.save_backtest_results(&persisted)?;
        }
        Err(e) => return Err(e.into()),
    }
    ok(json!({}))
}

// =============================================================================
// Historical data
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoricalQuery {
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    date: Option<NaiveDate>,
}

async fn get_historical(
    State(state): State<Arc<ApiState>>,
    Path(symbol): Path<String>,
    Query(query): Query<HistoricalQuery>,
) -> ApiResult {
    let days = state.store.list_historical_days(&symbol);
    let (start, end) = match (query.start_date, query.end_date) {
        (Some(s), Some(e)) => (s, e),
        _ => match (days.first(), days.last()) {
            (Some(&s), Some(&e)) => (s, e),
            _ => return ok(json!({ "bars": [], "days": [] })),
        },
    };

    let bars = state.store.load_historical_range(&symbol, start, end);
    ok(json!({ "bars": bars, "days": days }))
}

#[derive(Deserialize)]
struct HistoricalUpload {
    bars: Vec<Bar>,
}

/// Group bars into UTC-day buckets for day-file storage.
fn group_by_day(bars: Vec<Bar>) -> BTreeMap<NaiveDate, Vec<Bar>> {
    let mut days: BTreeMap<NaiveDate, Vec<Bar>> = BTreeMap::new();
    for bar in bars {
        days.entry(bar.timestamp.date_naive()).or_default().push(bar);
    }
    for bars in days.values_mut() {
        bars.sort_by_key(|b| b.timestamp);
    }
    days
}

async fn upload_historical(
    State(state): State<Arc<ApiState>>,
    Path(symbol): Path<String>,
    Json(upload): Json<HistoricalUpload>,
) -> ApiResult {
    let days = group_by_day(upload.bars);
    let mut saved_days = Vec::new();
    for (date, bars) in &days {
        state.store.save_historical_day(&symbol, *date, bars)?;
        saved_days.push(*date);
    }
    ok(json!({ "savedDays": saved_days }))
}

async fn delete_historical(
    State(state): State<Arc<ApiState>>,
    Path(symbol): Path<String>,
    Query(query): Query<HistoricalQuery>,
) -> ApiResult {
    let deleted = state.store.delete_historical(&symbol, query.date)?;
    ok(json!({ "deletedDays": deleted }))
}

// =============================================================================
// Trading / broker
// =============================================================================

async fn test_connection(State(state): State<Arc<ApiState>>) -> ApiResult {
    let token = state.manager.broker().authenticate().await.map_err(EngineError::from)?;
    ok(json!({ "expiresAt": token.expires_at.to_rfc3339() }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketDataRequest {
    contract_id: String,
}

async fn subscribe_market_data(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<MarketDataRequest>,
) -> ApiResult {
    {
        let watches = state.market_watches.lock();
        if watches.contains_key(&request.contract_id) {
            return ok(json!({ "alreadySubscribed": true }));
        }
    }

    let (subscription, mut rx) = state
        .manager
        .hub()
        .subscribe(&request.contract_id)
        .await
        .map_err(EngineError::from)?;

    // Keep the watch's queue drained; the data itself flows to instances
    // sharing the same upstream.
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    state
        .market_watches
        .lock()
        .insert(request.contract_id.clone(), subscription);
    ok(json!({ "contractId": request.contract_id }))
}

async fn unsubscribe_market_data(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<MarketDataRequest>,
) -> ApiResult {
    let subscription = state.market_watches.lock().remove(&request.contract_id);
    match subscription {
        Some(subscription) => {
            subscription.close().await;
            ok(json!({ "contractId": request.contract_id }))
        }
        None => Err(EngineError::not_found("market subscription", &request.contract_id).into()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountsQuery {
    #[serde(default)]
    only_active: bool,
}

async fn trading_accounts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AccountsQuery>,
) -> ApiResult {
    let accounts = state
        .manager
        .broker()
        .get_accounts(query.only_active)
        .await
        .map_err(EngineError::from)?;
    ok(json!({ "accounts": accounts }))
}

#[derive(Deserialize)]
struct ContractsQuery {
    query: String,
    #[serde(default)]
    live: bool,
}

async fn trading_contracts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ContractsQuery>,
) -> ApiResult {
    let contracts = state
        .manager
        .broker()
        .search_contracts(&query.query, query.live)
        .await
        .map_err(EngineError::from)?;
    ok(json!({ "contracts": contracts }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrokerHistoryQuery {
    contract_id: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

async fn trading_historical_data(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<BrokerHistoryQuery>,
) -> ApiResult {
    let bars = state
        .manager
        .broker()
        .get_historical_bars(&query.contract_id, query.start, query.end)
        .await
        .map_err(EngineError::from)?;
    ok(json!({ "bars": bars }))
}

async fn trading_status(State(state): State<Arc<ApiState>>) -> ApiResult {
    ok(json!({
        "openMarketStreams": state.manager.open_market_streams(),
        "marketWatches": state.market_watches.lock().len(),
    }))
}

async fn trading_server_status(State(state): State<Arc<ApiState>>) -> ApiResult {
    ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "serverTime": Utc::now().to_rfc3339(),
    }))
}
