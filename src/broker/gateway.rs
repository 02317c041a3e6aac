// =============================================================================
// Gateway client — production broker adapter (REST + WebSocket)
// =============================================================================
//
// Talks to the futures gateway's JSON API. Session tokens are cached and
// refreshed five minutes before expiry; a 401 invalidates the cache and the
// request is retried once with a fresh token. Network timeouts surface as
// `BrokerError::Transient` so runtimes can log and continue.
//
// SECURITY: the API key is only ever sent in the login body; it is never
// logged or embedded in URLs.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::broker::{
    Account, AuthToken, BrokerError, Contract, MarketBroker, OrderRequest, OrderResult,
    OrderType, StreamHandle, TradeSink, TradeTick,
};
use crate::market::series::Bar;
use crate::types::Side;

/// Auth requests time out faster than data requests.
const AUTH_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Refresh the cached token this long before it actually expires.
const TOKEN_REFRESH_MARGIN_MINS: i64 = 5;
/// Token lifetime assumed when the gateway omits `expiresIn`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 86_400;

pub struct GatewayClient {
    username: String,
    api_key: String,
    base_url: String,
    ws_url: String,
    http: reqwest::Client,
    auth_http: reqwest::Client,
    token: Mutex<Option<AuthToken>>,
}

impl GatewayClient {
    pub fn new(
        username: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        ws_url: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        let auth_http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(AUTH_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            username: username.into(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            ws_url: ws_url.into(),
            http,
            auth_http,
            token: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Auth
    // -------------------------------------------------------------------------

    fn cached_token(&self) -> Option<AuthToken> {
        let guard = self.token.lock();
        guard.as_ref().filter(|t| !needs_refresh(t, Utc::now())).cloned()
    }

    fn invalidate_token(&self) {
        *self.token.lock() = None;
    }

    async fn login(&self) -> Result<AuthToken, BrokerError> {
        let url = format!("{}/api/auth/login-key", self.base_url);
        let body = json!({ "userName": self.username, "apiKey": self.api_key });

        let resp = self
            .auth_http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Transient(format!("auth response unreadable: {e}")))?;

        if !status.is_success() || payload["success"] == serde_json::Value::Bool(false) {
            // Credentials look valid but the gateway rejects them: permanent.
            let detail = payload["errorMessage"]
                .as_str()
                .unwrap_or("login rejected")
                .to_string();
            return Err(BrokerError::Permanent(format!(
                "authentication failed ({status}): {detail}"
            )));
        }

        let token = payload["token"]
            .as_str()
            .ok_or_else(|| BrokerError::Permanent("auth response missing token".into()))?
            .to_string();
        let lifetime = payload["expiresIn"]
            .as_i64()
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

        let auth = AuthToken {
            token,
            expires_at: Utc::now() + Duration::seconds(lifetime),
        };
        info!(expires_at = %auth.expires_at, "gateway session established");
        *self.token.lock() = Some(auth.clone());
        Ok(auth)
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// POST `path` with `body`, refreshing the token and retrying once on 401.
    async fn post_authed(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, BrokerError> {
        for attempt in 0..2 {
            let token = self.authenticate().await?;
            let url = format!("{}{path}", self.base_url);

            let resp = self
                .http
                .post(&url)
                .bearer_auth(&token.token)
                .json(&body)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = resp.status();
            if status.as_u16() == 401 && attempt == 0 {
                warn!(path, "gateway returned 401 — refreshing token and retrying");
                self.invalidate_token();
                continue;
            }

            let payload: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| BrokerError::Transient(format!("response unreadable: {e}")))?;

            if !status.is_success() {
                return Err(if status.is_server_error() {
                    BrokerError::Transient(format!("gateway {path} returned {status}"))
                } else {
                    BrokerError::Permanent(format!("gateway {path} returned {status}: {payload}"))
                });
            }
            return Ok(payload);
        }
        Err(BrokerError::Permanent(format!(
            "gateway {path} rejected the refreshed token"
        )))
    }
}

fn needs_refresh(token: &AuthToken, now: DateTime<Utc>) -> bool {
    token.expires_at - now < Duration::minutes(TOKEN_REFRESH_MARGIN_MINS)
}

fn map_reqwest_error(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() || e.is_connect() {
        BrokerError::Transient(format!("gateway unreachable: {e}"))
    } else {
        BrokerError::Permanent(format!("gateway request failed: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Parse one gateway bar object (`{t, o, h, l, c, v}`) into a [`Bar`].
fn parse_bar(value: &serde_json::Value) -> Option<Bar> {
    Some(Bar {
        timestamp: value["t"].as_str().and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })?,
        open: value["o"].as_f64()?,
        high: value["h"].as_f64()?,
        low: value["l"].as_f64()?,
        close: value["c"].as_f64()?,
        volume: value["v"].as_u64().unwrap_or(0),
    })
}

/// Parse one gateway trade message into ticks. Messages carry either a single
/// trade object or an array of them.
fn parse_trades(contract_id: &str, value: &serde_json::Value) -> Vec<TradeTick> {
    let items: Vec<&serde_json::Value> = match value {
        serde_json::Value::Array(arr) => arr.iter().collect(),
        obj => vec![obj],
    };

    items
        .into_iter()
        .filter_map(|item| {
            Some(TradeTick {
                contract_id: contract_id.to_string(),
                price: item["price"].as_f64()?,
                size: item["volume"].as_u64().or_else(|| item["size"].as_u64())?,
                timestamp: item["timestamp"].as_str().and_then(|s| {
                    DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc))
                })?,
            })
        })
        .collect()
}

/// Gateway order-side code: 0 = buy, 1 = sell.
fn order_side_code(side: Side) -> Option<u8> {
    match side {
        Side::Long => Some(0),
        Side::Short => Some(1),
        Side::None => None,
    }
}

// ---------------------------------------------------------------------------
// MarketBroker implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl MarketBroker for GatewayClient {
    async fn authenticate(&self) -> Result<AuthToken, BrokerError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        self.login().await
    }

    async fn get_accounts(&self, only_active: bool) -> Result<Vec<Account>, BrokerError> {
        let payload = self
            .post_authed(
                "/api/account/search",
                json!({ "onlyActiveAccounts": only_active }),
            )
            .await?;

        let accounts = payload["accounts"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|a| serde_json::from_value(a.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(accounts)
    }

    async fn search_contracts(&self, query: &str, live: bool) -> Result<Vec<Contract>, BrokerError> {
        let payload = self
            .post_authed(
                "/api/contract/search",
                json!({ "searchText": query, "live": live }),
            )
            .await?;

        let contracts = payload["contracts"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| serde_json::from_value(c.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(contracts)
    }

    async fn get_historical_bars(
        &self,
        contract_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BrokerError> {
        let payload = self
            .post_authed(
                "/api/history/retrieve-bars",
                json!({
                    "contractId": contract_id,
                    "startTime": start.to_rfc3339(),
                    "endTime": end.to_rfc3339(),
                    "unit": "minute",
                    "unitNumber": 1,
                }),
            )
            .await?;

        let mut bars: Vec<Bar> = payload["bars"]
            .as_array()
            .map(|arr| arr.iter().filter_map(parse_bar).collect())
            .unwrap_or_default();
        bars.sort_by_key(|b| b.timestamp);
        debug!(contract = %contract_id, count = bars.len(), "historical bars retrieved");
        Ok(bars)
    }

    async fn subscribe_trades(
        &self,
        contract_id: &str,
        sink: TradeSink,
    ) -> Result<Box<dyn StreamHandle>, BrokerError> {
        let token = self.authenticate().await?;
        let url = format!("{}/market?access_token={}", self.ws_url, token.token);
        let contract = contract_id.to_string();

        let (ws_stream, _response) = connect_async(&url)
            .await
            .map_err(|e| BrokerError::Transient(format!("market WebSocket connect failed: {e}")))?;
        info!(contract = %contract, "market WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        {
            use futures_util::SinkExt;
            let subscribe = json!({ "action": "subscribe", "channel": "trades", "contractId": contract });
            write
                .send(tokio_tungstenite::tungstenite::Message::Text(
                    subscribe.to_string().into(),
                ))
                .await
                .map_err(|e| BrokerError::Transient(format!("subscribe send failed: {e}")))?;
        }

        let task = tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(value) => {
                                let ticks = parse_trades(&contract, &value["data"]);
                                if !ticks.is_empty() && sink.send(ticks).await.is_err() {
                                    debug!(contract = %contract, "trade sink closed — ending stream");
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to parse trade message");
                            }
                        }
                    }
                    Some(Ok(_)) => {
                        // Ping / Pong / Binary frames need no handling here.
                    }
                    Some(Err(e)) => {
                        error!(contract = %contract, error = %e, "market WebSocket read error");
                        return;
                    }
                    None => {
                        warn!(contract = %contract, "market WebSocket stream ended");
                        return;
                    }
                }
            }
        });

        Ok(Box::new(GatewayStreamHandle {
            task: Arc::new(task),
        }))
    }

    async fn place_order(&self, order: OrderRequest) -> Result<OrderResult, BrokerError> {
        let Some(side) = order_side_code(order.side) else {
            return Err(BrokerError::Permanent("cannot place a flat order".into()));
        };
        let order_type = match order.order_type {
            OrderType::Market => 2,
            OrderType::Limit => 1,
        };

        let payload = self
            .post_authed(
                "/api/order/place",
                json!({
                    "accountId": order.account_id,
                    "contractId": order.contract_id,
                    "type": order_type,
                    "side": side,
                    "size": order.quantity,
                    "customTag": order.custom_tag,
                }),
            )
            .await?;

        let success = payload["success"].as_bool().unwrap_or(false);
        Ok(OrderResult {
            success,
            order_id: payload["orderId"]
                .as_i64()
                .map(|id| id.to_string())
                .or_else(|| payload["orderId"].as_str().map(str::to_string)),
            error: payload["errorMessage"].as_str().map(str::to_string),
        })
    }
}

struct GatewayStreamHandle {
    task: Arc<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl StreamHandle for GatewayStreamHandle {
    async fn close(&self) {
        self.task.abort();
    }
}
