pub mod rest;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backtest::BacktestExecutor;
use crate::broker::subscriptions::TradeSubscription;
use crate::events::EventBus;
use crate::manager::InstanceManager;
use crate::store::DocumentStore;

/// Shared state for every API handler.
pub struct ApiState {
    pub manager: Arc<InstanceManager>,
    pub executor: Arc<BacktestExecutor>,
    pub events: EventBus,
    pub store: Arc<DocumentStore>,
    pub started_at: std::time::Instant,
    /// Ad-hoc market-data watches opened via /trading/subscribe-market-data,
    /// keyed by contract id.
    pub market_watches: Mutex<HashMap<String, TradeSubscription>>,
}

impl ApiState {
    pub fn new(
        manager: Arc<InstanceManager>,
        executor: Arc<BacktestExecutor>,
        events: EventBus,
        store: Arc<DocumentStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            executor,
            events,
            store,
            started_at: std::time::Instant::now(),
            market_watches: Mutex::new(HashMap::new()),
        })
    }
}
