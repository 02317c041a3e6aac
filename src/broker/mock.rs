// =============================================================================
// Mock broker — deterministic in-process implementation for tests and
// simulation-only deployments
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::broker::{
    Account, AuthToken, BrokerError, Contract, MarketBroker, OrderRequest, OrderResult,
    StreamHandle, TradeSink, TradeTick,
};
use crate::market::series::Bar;

type StreamMap = Arc<Mutex<HashMap<String, TradeSink>>>;

/// In-memory broker double. Tests drive it directly: seed historical bars
/// with [`MockBroker::set_historical_bars`], push live ticks with
/// [`MockBroker::push_trades`], and inspect submitted orders afterwards.
pub struct MockBroker {
    streams: StreamMap,
    streams_closed: Arc<AtomicU64>,
    historical: Mutex<HashMap<String, Vec<Bar>>>,
    orders: Mutex<Vec<OrderRequest>>,
    accounts: Mutex<Vec<Account>>,
    contracts: Mutex<Vec<Contract>>,
    fail_orders: Mutex<Option<String>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            streams_closed: Arc::new(AtomicU64::new(0)),
            historical: Mutex::new(HashMap::new()),
            orders: Mutex::new(Vec::new()),
            accounts: Mutex::new(vec![Account {
                id: "sim-account".into(),
                name: "Simulated".into(),
                balance: 50_000.0,
                can_trade: true,
            }]),
            contracts: Mutex::new(Vec::new()),
            fail_orders: Mutex::new(None),
        }
    }

    // ── Test drivers ────────────────────────────────────────────────────

    /// Deliver a batch of trades to the open stream for `contract_id`.
    pub async fn push_trades(&self, contract_id: &str, batch: Vec<TradeTick>) {
        let sink = self.streams.lock().get(contract_id).cloned();
        if let Some(sink) = sink {
            let _ = sink.send(batch).await;
        }
    }

    pub fn set_historical_bars(&self, contract_id: &str, bars: Vec<Bar>) {
        self.historical.lock().insert(contract_id.to_string(), bars);
    }

    pub fn set_contracts(&self, contracts: Vec<Contract>) {
        *self.contracts.lock() = contracts;
    }

    /// Make subsequent orders fail with `error`.
    pub fn fail_orders_with(&self, error: impl Into<String>) {
        *self.fail_orders.lock() = Some(error.into());
    }

    // ── Inspection ──────────────────────────────────────────────────────

    pub fn open_stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn total_streams_closed(&self) -> u64 {
        self.streams_closed.load(Ordering::SeqCst)
    }

    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().clone()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketBroker for MockBroker {
    async fn authenticate(&self) -> Result<AuthToken, BrokerError> {
        Ok(AuthToken {
            token: "mock-token".into(),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    async fn get_accounts(&self, only_active: bool) -> Result<Vec<Account>, BrokerError> {
        let accounts = self.accounts.lock().clone();
        Ok(if only_active {
            accounts.into_iter().filter(|a| a.can_trade).collect()
        } else {
            accounts
        })
    }

    async fn search_contracts(&self, query: &str, live: bool) -> Result<Vec<Contract>, BrokerError> {
        let query = query.to_uppercase();
        Ok(self
            .contracts
            .lock()
            .iter()
            .filter(|c| c.name.to_uppercase().contains(&query))
            .filter(|c| !live || c.active)
            .cloned()
            .collect())
    }

    async fn get_historical_bars(
        &self,
        contract_id: &str,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    ) -> Result<Vec<Bar>, BrokerError> {
        let bars = self
            .historical
            .lock()
            .get(contract_id)
            .cloned()
            .unwrap_or_default();
        Ok(bars
            .into_iter()
            .filter(|b| b.timestamp >= start && b.timestamp < end)
            .collect())
    }

    async fn subscribe_trades(
        &self,
        contract_id: &str,
        sink: TradeSink,
    ) -> Result<Box<dyn StreamHandle>, BrokerError> {
        self.streams.lock().insert(contract_id.to_string(), sink);
        Ok(Box::new(MockStreamHandle {
            contract_id: contract_id.to_string(),
            streams: Arc::clone(&self.streams),
            streams_closed: Arc::clone(&self.streams_closed),
        }))
    }

    async fn place_order(&self, order: OrderRequest) -> Result<OrderResult, BrokerError> {
        if let Some(error) = self.fail_orders.lock().clone() {
            return Ok(OrderResult {
                success: false,
                order_id: None,
                error: Some(error),
            });
        }
        self.orders.lock().push(order);
        Ok(OrderResult {
            success: true,
            order_id: Some(Uuid::new_v4().to_string()),
            error: None,
        })
    }
}

struct MockStreamHandle {
    contract_id: String,
    streams: StreamMap,
    streams_closed: Arc<AtomicU64>,
}

#[async_trait]
impl StreamHandle for MockStreamHandle {
    async fn close(&self) {
        // Dropping the sink ends the consumer side; count each real close
        // once so tests can assert "closed exactly once".
        if self.streams.lock().remove(&self.contract_id).is_some() {
            self.streams_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::TimeZone;

    #[tokio::test]
    async fn historical_bars_filter_by_range() {
        let mock = MockBroker::new();
        let base = Utc.timestamp_opt(1_700_000_040, 0).unwrap();
        let bars: Vec<Bar> = (0..10)
            .map(|i| Bar {
                timestamp: base + Duration::minutes(i),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 10,
            })
            .collect();
        mock.set_historical_bars("C", bars);

        let got = mock
            .get_historical_bars("C", base + Duration::minutes(2), base + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
    }

    #[tokio::test]
    async fn orders_recorded_and_failable() {
        let mock = MockBroker::new();
        let order = OrderRequest {
            account_id: "a".into(),
            contract_id: "c".into(),
            side: Side::Long,
            quantity: 1,
            order_type: crate::broker::OrderType::Market,
            custom_tag: None,
        };

        let res = mock.place_order(order.clone()).await.unwrap();
        assert!(res.success);
        assert_eq!(mock.placed_orders().len(), 1);

        mock.fail_orders_with("margin exceeded");
        let res = mock.place_order(order).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("margin exceeded"));
        assert_eq!(mock.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn accounts_filter_active() {
        let mock = MockBroker::new();
        mock.accounts.lock().push(Account {
            id: "closed".into(),
            name: "Closed".into(),
            balance: 0.0,
            can_trade: false,
        });
        assert_eq!(mock.get_accounts(true).await.unwrap().len(), 1);
        assert_eq!(mock.get_accounts(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn contract_search_matches_name() {
        let mock = MockBroker::new();
        mock.set_contracts(vec![
            Contract {
                id: "CON.F.US.ENQ.U25".into(),
                name: "ENQ".into(),
                description: "E-mini Nasdaq".into(),
                tick_size: 0.25,
                active: true,
            },
            Contract {
                id: "CON.F.US.ES.U25".into(),
                name: "ES".into(),
                description: "E-mini S&P".into(),
                tick_size: 0.25,
                active: false,
            },
        ]);

        assert_eq!(mock.search_contracts("enq", false).await.unwrap().len(), 1);
        assert_eq!(mock.search_contracts("es", true).await.unwrap().len(), 0);
        assert_eq!(mock.search_contracts("e", false).await.unwrap().len(), 2);
    }
}
