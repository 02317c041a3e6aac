// =============================================================================
// Event bus — typed in-process pub/sub
// =============================================================================
//
// Runtimes, the backtest executor, and the instance manager publish
// `EngineEvent`s; the WebSocket layer and tests subscribe. Built on
// `tokio::sync::broadcast`: every subscriber has its own bounded queue and a
// slow subscriber lags (dropping its oldest undelivered events) without
// affecting publishers or other subscribers.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::market::series::Bar;
use crate::types::{BacktestStatus, Side, SignalKind};

/// Default per-subscriber queue bound.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// An ENTRY or EXIT emitted by a runtime or backtest at a specific bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub kind: SignalKind,
    pub side: Side,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Every event the engine publishes. Serialized with a `type` tag so push
/// subscribers can route without knowing the Rust types.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    InstanceCreated { instance_id: String, name: String },

    #[serde(rename_all = "camelCase")]
    InstanceDeleted { instance_id: String },

    #[serde(rename_all = "camelCase")]
    InstanceStateChanged {
        instance_id: String,
        state: serde_json::Value,
    },

    #[serde(rename_all = "camelCase")]
    InstanceSignal {
        instance_id: String,
        signal: Signal,
    },

    #[serde(rename_all = "camelCase")]
    InstanceLog { instance_id: String, line: String },

    #[serde(rename_all = "camelCase")]
    InstanceDataUpdate {
        instance_id: String,
        bar: Bar,
        is_new_bar: bool,
    },

    #[serde(rename_all = "camelCase")]
    BacktestUpdate {
        backtest_id: String,
        status: BacktestStatus,
        progress: f64,
    },
}

impl EngineEvent {
    /// The instance or backtest this event belongs to.
    pub fn subject_id(&self) -> &str {
        match self {
            Self::InstanceCreated { instance_id, .. }
            | Self::InstanceDeleted { instance_id }
            | Self::InstanceStateChanged { instance_id, .. }
            | Self::InstanceSignal { instance_id, .. }
            | Self::InstanceLog { instance_id, .. }
            | Self::InstanceDataUpdate { instance_id, .. } => instance_id,
            Self::BacktestUpdate { backtest_id, .. } => backtest_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Cloneable handle to the engine-wide event channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Publishing with no live subscribers is a no-op.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
