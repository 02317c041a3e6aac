// =============================================================================
// Broker adapter — the engine's only gateway to the outside market
// =============================================================================
//
// `MarketBroker` is object-safe so the engine can run against the production
// gateway client or the in-process mock interchangeably. Streaming hands the
// caller a `StreamHandle` for cancellation; trade batches arrive through the
// mpsc sink the caller supplied.
// =============================================================================

pub mod gateway;
pub mod mock;
pub mod subscriptions;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::errors::EngineError;
use crate::market::series::Bar;
use crate::types::Side;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Recoverable: timeouts, disconnects, rate limiting. Runtimes log these
    /// and keep going.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Unrecoverable: rejected credentials, closed account.
    #[error("permanent broker error: {0}")]
    Permanent(String),
}

impl From<BrokerError> for EngineError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Transient(msg) => EngineError::Transient(msg),
            BrokerError::Permanent(msg) => EngineError::Permanent(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A cached session token.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub can_trade: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tick_size: f64,
    #[serde(default)]
    pub active: bool,
}

/// One trade print from the market-data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeTick {
    pub contract_id: String,
    pub price: f64,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub account_id: String,
    pub contract_id: String,
    pub side: Side,
    pub quantity: u32,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub custom_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResult {
    pub success: bool,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Cancellable handle for one upstream market-data stream.
#[async_trait]
pub trait StreamHandle: Send + Sync {
    /// Stop the underlying stream. Idempotent.
    async fn close(&self);
}

/// Sink the broker pushes trade batches into.
pub type TradeSink = mpsc::Sender<Vec<TradeTick>>;

// ---------------------------------------------------------------------------
// The adapter
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MarketBroker: Send + Sync {
    /// Obtain (or reuse) a session token. Implementations cache the token and
    /// refresh it five minutes before expiry.
    async fn authenticate(&self) -> Result<AuthToken, BrokerError>;

    async fn get_accounts(&self, only_active: bool) -> Result<Vec<Account>, BrokerError>;

    async fn search_contracts(&self, query: &str, live: bool) -> Result<Vec<Contract>, BrokerError>;

    /// Ordered 1-minute bars for `[start, end)`.
    async fn get_historical_bars(
        &self,
        contract_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BrokerError>;

    /// Open one upstream trade stream for `contract_id`, pushing batches into
    /// `sink`. Callers needing fan-out go through
    /// [`subscriptions::SubscriptionHub`], which guarantees at most one
    /// upstream stream per contract.
    async fn subscribe_trades(
        &self,
        contract_id: &str,
        sink: TradeSink,
    ) -> Result<Box<dyn StreamHandle>, BrokerError>;

    async fn place_order(&self, order: OrderRequest) -> Result<OrderResult, BrokerError>;
}
