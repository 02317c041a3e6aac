// =============================================================================
// Subscription hub — ref-counted trade-stream fan-out
// =============================================================================
//
// At most one upstream broker stream exists per contract. The first consumer
// opens it, later consumers attach to the fan-out, and the last consumer to
// detach closes it. Consumers receive trade batches through their own bounded
// mpsc channel; a consumer that falls behind has batches dropped (the bar
// builder coalesces, so lost intermediate ticks only cost intra-bar detail).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, MarketBroker, StreamHandle, TradeTick};

/// Queue depth per consumer.
const CONSUMER_QUEUE: usize = 256;
/// Queue depth between the upstream stream and the fan-out task.
const UPSTREAM_QUEUE: usize = 512;

type ConsumerSet = Arc<Mutex<Vec<(u64, mpsc::Sender<Vec<TradeTick>>)>>>;

struct Upstream {
    handle: Box<dyn StreamHandle>,
    fanout_task: tokio::task::JoinHandle<()>,
    consumers: ConsumerSet,
    next_consumer_id: u64,
}

struct HubInner {
    broker: Arc<dyn MarketBroker>,
    upstreams: Mutex<HashMap<String, Upstream>>,
}

/// Cloneable hub guaranteeing one upstream stream per contract.
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    pub fn new(broker: Arc<dyn MarketBroker>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                broker,
                upstreams: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach a consumer to `contract_id`, opening the upstream stream if
    /// this is the first one. Returns the consumer's receiving end and a
    /// guard used to detach.
    pub async fn subscribe(
        &self,
        contract_id: &str,
    ) -> Result<(TradeSubscription, mpsc::Receiver<Vec<TradeTick>>), BrokerError> {
        let (tx, rx) = mpsc::channel(CONSUMER_QUEUE);

        // Fast path: attach to an existing upstream.
        {
            let mut upstreams = self.inner.upstreams.lock();
            if let Some(upstream) = upstreams.get_mut(contract_id) {
                let id = upstream.next_consumer_id;
                upstream.next_consumer_id += 1;
                upstream.consumers.lock().push((id, tx));
                debug!(contract = %contract_id, consumer = id, "attached to existing stream");
                return Ok((self.guard(contract_id, id), rx));
            }
        }

        // First consumer: open the upstream outside the lock, then publish it.
        let (upstream_tx, mut upstream_rx) = mpsc::channel::<Vec<TradeTick>>(UPSTREAM_QUEUE);
        let handle = self
            .inner
            .broker
            .subscribe_trades(contract_id, upstream_tx)
            .await?;

        let consumers: ConsumerSet = Arc::new(Mutex::new(vec![(0, tx)]));
        let fanout_consumers = Arc::clone(&consumers);
        let fanout_contract = contract_id.to_string();
        let fanout_task = tokio::spawn(async move {
            while let Some(batch) = upstream_rx.recv().await {
                let sinks: Vec<(u64, mpsc::Sender<Vec<TradeTick>>)> =
                    fanout_consumers.lock().clone();
                for (id, sink) in sinks {
                    if sink.try_send(batch.clone()).is_err() {
                        warn!(
                            contract = %fanout_contract,
                            consumer = id,
                            "consumer queue full — batch dropped"
                        );
                    }
                }
            }
            debug!(contract = %fanout_contract, "upstream stream ended");
        });

        let mut upstreams = self.inner.upstreams.lock();
        // A racing subscriber may have created the entry between our check
        // and the upstream connect; fold our consumer into theirs and close
        // the redundant stream.
        if let Some(existing) = upstreams.get_mut(contract_id) {
            fanout_task.abort();
            let first = consumers.lock().pop();
            let id = existing.next_consumer_id;
            existing.next_consumer_id += 1;
            if let Some((_, tx)) = first {
                existing.consumers.lock().push((id, tx));
            }
            let stale_handle = handle;
            tokio::spawn(async move { stale_handle.close().await });
            return Ok((self.guard(contract_id, id), rx));
        }

        info!(contract = %contract_id, "upstream trade stream opened");
        upstreams.insert(
            contract_id.to_string(),
            Upstream {
                handle,
                fanout_task,
                consumers,
                next_consumer_id: 1,
            },
        );

        Ok((self.guard(contract_id, 0), rx))
    }

    fn guard(&self, contract_id: &str, consumer_id: u64) -> TradeSubscription {
        TradeSubscription {
            hub: Arc::clone(&self.inner),
            contract_id: contract_id.to_string(),
            consumer_id,
        }
    }

    /// Number of live upstream streams (test / status visibility).
    pub fn open_streams(&self) -> usize {
        self.inner.upstreams.lock().len()
    }

    /// Number of consumers attached to `contract_id`.
    pub fn consumer_count(&self, contract_id: &str) -> usize {
        self.inner
            .upstreams
            .lock()
            .get(contract_id)
            .map(|u| u.consumers.lock().len())
            .unwrap_or(0)
    }
}

/// Detach one consumer; closes the upstream when it was the last.
async fn unsubscribe(inner: &HubInner, contract_id: &str, consumer_id: u64) {
    let closing = {
        let mut upstreams = inner.upstreams.lock();
        let Some(upstream) = upstreams.get_mut(contract_id) else {
            return;
        };
        {
            let mut consumers = upstream.consumers.lock();
            consumers.retain(|(id, _)| *id != consumer_id);
            if !consumers.is_empty() {
                debug!(
                    contract = %contract_id,
                    remaining = consumers.len(),
                    "consumer detached"
                );
                return;
            }
        }
        upstreams.remove(contract_id)
    };

    if let Some(upstream) = closing {
        upstream.handle.close().await;
        upstream.fanout_task.abort();
        info!(contract = %contract_id, "upstream trade stream closed");
    }
}

// ---------------------------------------------------------------------------
// Subscription guard
// ---------------------------------------------------------------------------

/// Guard for one consumer's attachment. Call [`TradeSubscription::close`]
/// when the runtime stops; closing an already-detached consumer is harmless.
pub struct TradeSubscription {
    hub: Arc<HubInner>,
    contract_id: String,
    consumer_id: u64,
}

impl TradeSubscription {
    pub fn contract_id(&self) -> &str {
        &self.contract_id
    }

    pub async fn close(self) {
        unsubscribe(&self.hub, &self.contract_id, self.consumer_id).await;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use chrono::Utc;

    fn tick(price: f64) -> TradeTick {
        TradeTick {
            contract_id: "CON.F.ES".into(),
            price,
            size: 1,
            timestamp: Utc::now(),
        }
    }

    fn hub_with_mock() -> (Arc<MockBroker>, SubscriptionHub) {
        let mock = Arc::new(MockBroker::new());
        let hub = SubscriptionHub::new(mock.clone() as Arc<dyn MarketBroker>);
        (mock, hub)
    }

    #[tokio::test]
    async fn single_stream_for_two_consumers() {
        // S6: two runtimes subscribe to one contract; the broker opens one
        // stream, and it closes only when the second consumer detaches.
        let (mock, hub) = hub_with_mock();

        let (sub_a, mut rx_a) = hub.subscribe("CON.F.ES").await.unwrap();
        let (sub_b, mut rx_b) = hub.subscribe("CON.F.ES").await.unwrap();

        assert_eq!(mock.open_stream_count(), 1);
        assert_eq!(hub.open_streams(), 1);
        assert_eq!(hub.consumer_count("CON.F.ES"), 2);

        // Both consumers see the same batch.
        mock.push_trades("CON.F.ES", vec![tick(4500.0)]).await;
        assert_eq!(rx_a.recv().await.unwrap()[0].price, 4500.0);
        assert_eq!(rx_b.recv().await.unwrap()[0].price, 4500.0);

        sub_a.close().await;
        assert_eq!(mock.open_stream_count(), 1, "stream must stay open");
        assert_eq!(hub.consumer_count("CON.F.ES"), 1);

        sub_b.close().await;
        assert_eq!(mock.open_stream_count(), 0, "last detach closes the stream");
        assert_eq!(mock.total_streams_closed(), 1, "closed exactly once");
        assert_eq!(hub.open_streams(), 0);
    }

    #[tokio::test]
    async fn distinct_contracts_get_distinct_streams() {
        let (mock, hub) = hub_with_mock();

        let (sub_a, _rx_a) = hub.subscribe("CON.F.ES").await.unwrap();
        let (sub_b, _rx_b) = hub.subscribe("CON.F.NQ").await.unwrap();

        assert_eq!(mock.open_stream_count(), 2);

        sub_a.close().await;
        sub_b.close().await;
        assert_eq!(mock.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn close_of_unknown_consumer_is_harmless() {
        let (mock, hub) = hub_with_mock();

        let (sub, _rx) = hub.subscribe("CON.F.ES").await.unwrap();
        sub.close().await;
        // Detaching an already-removed consumer id must not panic or reopen.
        unsubscribe(&hub.inner, "CON.F.ES", 0).await;
        assert_eq!(mock.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn resubscribe_after_close_reopens() {
        let (mock, hub) = hub_with_mock();

        let (sub, _rx) = hub.subscribe("CON.F.ES").await.unwrap();
        sub.close().await;

        let (sub2, mut rx2) = hub.subscribe("CON.F.ES").await.unwrap();
        assert_eq!(mock.open_stream_count(), 1);
        mock.push_trades("CON.F.ES", vec![tick(4501.0)]).await;
        assert_eq!(rx2.recv().await.unwrap()[0].price, 4501.0);
        sub2.close().await;
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_block_others() {
        let (mock, hub) = hub_with_mock();

        let (sub_a, rx_a) = hub.subscribe("CON.F.ES").await.unwrap();
        let (sub_b, mut rx_b) = hub.subscribe("CON.F.ES").await.unwrap();
        drop(rx_a); // consumer A went away without detaching

        mock.push_trades("CON.F.ES", vec![tick(1.0)]).await;
        assert_eq!(rx_b.recv().await.unwrap()[0].price, 1.0);

        sub_a.close().await;
        sub_b.close().await;
        assert_eq!(mock.open_stream_count(), 0);
    }
}
