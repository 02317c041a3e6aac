// =============================================================================
// Instance manager — single owner of the instance set and algorithm catalog
// =============================================================================
//
// Every Runtime is created, started, stopped, and deleted through the
// manager. It also owns the subscription hub (so two instances on the same
// contract share one upstream stream), persists definitions through the
// document store, and runs the 1-second state poll that turns per-instance
// mutations into `instanceStateChanged` events.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::algorithm::Algorithm;
use crate::broker::subscriptions::SubscriptionHub;
use crate::broker::MarketBroker;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::position::ClosedTrade;
use crate::runtime::{ChartData, InstanceConfig, InstanceRuntime, InstanceState};
use crate::store::DocumentStore;
use crate::types::InstanceStatus;

/// Interval of the state-polling loop.
const POLL_INTERVAL_MS: u64 = 1000;

/// Partial update for an instance definition. Only present fields change.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePatch {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub contract_id: Option<String>,
    pub account_id: Option<String>,
    pub algorithm_name: Option<String>,
    pub simulation_mode: Option<bool>,
    pub starting_capital: Option<f64>,
    pub commission: Option<f64>,
}

pub struct InstanceManager {
    broker: Arc<dyn MarketBroker>,
    hub: SubscriptionHub,
    events: EventBus,
    store: Arc<DocumentStore>,
    algorithms: RwLock<HashMap<String, Arc<Algorithm>>>,
    instances: RwLock<HashMap<String, Arc<InstanceRuntime>>>,
    last_poll: Mutex<HashMap<String, InstanceState>>,
}

impl InstanceManager {
    /// Build the manager, loading the algorithm catalog and instance
    /// definitions from the store. All loaded instances come up STOPPED.
    pub fn new(
        broker: Arc<dyn MarketBroker>,
        events: EventBus,
        store: Arc<DocumentStore>,
    ) -> Arc<Self> {
        let hub = SubscriptionHub::new(Arc::clone(&broker));

        let mut algorithms = HashMap::new();
        for algorithm in store.load_algorithms() {
            if let Err(e) = algorithm.validate() {
                warn!(name = %algorithm.name, error = %e, "stored algorithm invalid — skipped");
                continue;
            }
            algorithms.insert(algorithm.name.clone(), Arc::new(algorithm));
        }

        let manager = Arc::new(Self {
            broker,
            hub,
            events,
            store,
            algorithms: RwLock::new(algorithms),
            instances: RwLock::new(HashMap::new()),
            last_poll: Mutex::new(HashMap::new()),
        });

        for config in manager.store.load_instances() {
            if let Err(e) = manager.register_runtime(config, false) {
                warn!(error = %e, "stored instance could not be registered");
            }
        }
        info!(
            algorithms = manager.algorithms.read().len(),
            instances = manager.instances.read().len(),
            "instance manager initialised"
        );

        manager
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn MarketBroker> {
        &self.broker
    }

    pub fn hub(&self) -> SubscriptionHub {
        self.hub.clone()
    }

    // -------------------------------------------------------------------------
    // Instance CRUD
    // -------------------------------------------------------------------------

    fn register_runtime(&self, config: InstanceConfig, emit: bool) -> EngineResult<InstanceState> {
        if config.name.trim().is_empty() {
            return Err(EngineError::Validation("instance name is empty".into()));
        }
        let algorithm = self
            .algorithms
            .read()
            .get(&config.algorithm_name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("algorithm", &config.algorithm_name))?;

        let mut instances = self.instances.write();
        if instances.contains_key(&config.id) {
            return Err(EngineError::Conflict(format!(
                "instance {} already exists",
                config.id
            )));
        }

        let runtime = Arc::new(InstanceRuntime::new(
            config.clone(),
            Some(algorithm),
            Arc::clone(&self.broker),
            self.hub.clone(),
            self.events.clone(),
        ));
        let state = runtime.get_state();
        instances.insert(config.id.clone(), runtime);
        drop(instances);

        if emit {
            self.events.publish(EngineEvent::InstanceCreated {
                instance_id: config.id,
                name: config.name,
            });
        }
        Ok(state)
    }

    /// Create a new instance. With `save`, the definition set is persisted.
    pub fn create_instance(
        &self,
        config: InstanceConfig,
        save: bool,
    ) -> EngineResult<InstanceState> {
        let config = if config.id.trim().is_empty() {
            config.with_new_id()
        } else {
            config
        };
        let state = self.register_runtime(config, true)?;
        if save {
            self.persist_instances()?;
        }
        Ok(state)
    }

    /// Apply a patch to a STOPPED instance and persist the definition set.
    pub fn update_instance(&self, id: &str, patch: InstancePatch) -> EngineResult<InstanceState> {
        let runtime = self.runtime(id)?;
        if runtime.status() != InstanceStatus::Stopped {
            return Err(EngineError::Conflict(
                "instance must be stopped before updating".into(),
            ));
        }

        let mut config = runtime.config();
        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(EngineError::Validation("instance name is empty".into()));
            }
            config.name = name;
        }
        if let Some(symbol) = patch.symbol {
            config.symbol = symbol;
        }
        if let Some(contract_id) = patch.contract_id {
            config.contract_id = contract_id;
        }
        if let Some(account_id) = patch.account_id {
            config.account_id = account_id;
        }
        if let Some(simulation_mode) = patch.simulation_mode {
            config.simulation_mode = simulation_mode;
        }
        if let Some(starting_capital) = patch.starting_capital {
            config.starting_capital = starting_capital;
        }
        if let Some(commission) = patch.commission {
            config.commission = commission;
        }
        if let Some(algorithm_name) = patch.algorithm_name {
            let algorithm = self
                .algorithms
                .read()
                .get(&algorithm_name)
                .cloned()
                .ok_or_else(|| EngineError::not_found("algorithm", &algorithm_name))?;
            config.algorithm_name = algorithm_name;
            runtime.set_algorithm(algorithm);
        }

        runtime.apply_config(config);
        self.persist_instances()?;
        Ok(runtime.get_state())
    }

    /// Stop, tear down, and forget an instance.
    pub async fn delete_instance(&self, id: &str) -> EngineResult<()> {
        let runtime = self.runtime(id)?;
        runtime.dispose().await;

        self.instances.write().remove(id);
        self.last_poll.lock().remove(id);
        self.events.publish(EngineEvent::InstanceDeleted {
            instance_id: id.to_string(),
        });
        self.persist_instances()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub async fn start_instance(&self, id: &str) -> EngineResult<()> {
        self.runtime(id)?.start().await
    }

    pub async fn stop_instance(&self, id: &str) -> EngineResult<()> {
        self.runtime(id)?.stop().await
    }

    pub fn pause_instance(&self, id: &str) -> EngineResult<()> {
        self.runtime(id)?.pause()
    }

    pub fn resume_instance(&self, id: &str) -> EngineResult<()> {
        self.runtime(id)?.resume()
    }

    /// Stop every running instance (shutdown path).
    pub async fn stop_all(&self) {
        let runtimes: Vec<Arc<InstanceRuntime>> =
            self.instances.read().values().cloned().collect();
        for runtime in runtimes {
            if let Err(e) = runtime.stop().await {
                warn!(instance = %runtime.id(), error = %e, "stop failed during shutdown");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    fn runtime(&self, id: &str) -> EngineResult<Arc<InstanceRuntime>> {
        self.instances
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("instance", id))
    }

    pub fn get_state(&self, id: &str) -> EngineResult<InstanceState> {
        Ok(self.runtime(id)?.get_state())
    }

    pub fn get_all_states(&self) -> Vec<InstanceState> {
        let mut states: Vec<InstanceState> = self
            .instances
            .read()
            .values()
            .map(|r| r.get_state())
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    pub fn get_all_configs(&self) -> Vec<InstanceConfig> {
        let mut configs: Vec<InstanceConfig> = self
            .instances
            .read()
            .values()
            .map(|r| r.config())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub fn instance_logs(&self, id: &str) -> EngineResult<Vec<String>> {
        Ok(self.runtime(id)?.logs())
    }

    pub fn instance_trades(&self, id: &str) -> EngineResult<Vec<ClosedTrade>> {
        Ok(self.runtime(id)?.trades())
    }

    pub fn instance_chart_data(&self, id: &str, limit: usize) -> EngineResult<ChartData> {
        Ok(self.runtime(id)?.chart_data(limit))
    }

    /// (total instances, running instances) for the health endpoint.
    pub fn engine_counts(&self) -> (usize, usize) {
        let instances = self.instances.read();
        let running = instances
            .values()
            .filter(|r| r.status() == InstanceStatus::Running)
            .count();
        (instances.len(), running)
    }

    pub fn open_market_streams(&self) -> usize {
        self.hub.open_streams()
    }

    // -------------------------------------------------------------------------
    // Algorithm catalog
    // -------------------------------------------------------------------------

    pub fn list_algorithms(&self) -> Vec<Algorithm> {
        let mut algorithms: Vec<Algorithm> = self
            .algorithms
            .read()
            .values()
            .map(|a| (**a).clone())
            .collect();
        algorithms.sort_by(|a, b| a.name.cmp(&b.name));
        algorithms
    }

    pub fn get_algorithm(&self, name: &str) -> EngineResult<Arc<Algorithm>> {
        self.algorithms
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("algorithm", name))
    }

    /// Validate, persist, and publish an algorithm. Instances bound to the
    /// same name pick up the new version (copy-on-write swap).
    pub fn save_algorithm(&self, mut algorithm: Algorithm) -> EngineResult<Algorithm> {
        DocumentStore::check_algorithm_name(&algorithm.name)?;
        algorithm.validate()?;
        algorithm.touch();
        self.store.save_algorithm(&algorithm)?;

        let shared = Arc::new(algorithm.clone());
        self.algorithms
            .write()
            .insert(algorithm.name.clone(), Arc::clone(&shared));

        for runtime in self.instances.read().values() {
            if runtime.config().algorithm_name == algorithm.name {
                runtime.set_algorithm(Arc::clone(&shared));
            }
        }

        Ok(algorithm)
    }

    /// Remove an algorithm that no instance references.
    pub fn delete_algorithm(&self, name: &str) -> EngineResult<()> {
        let referenced = self
            .instances
            .read()
            .values()
            .any(|r| r.config().algorithm_name == name);
        if referenced {
            return Err(EngineError::Conflict(format!(
                "algorithm '{name}' is referenced by an instance"
            )));
        }

        if self.algorithms.write().remove(name).is_none() {
            return Err(EngineError::not_found("algorithm", name));
        }
        self.store.delete_algorithm(name)
    }

    // -------------------------------------------------------------------------
    // State polling
    // -------------------------------------------------------------------------

    /// One polling pass: diff each RUNNING instance's snapshot against the
    /// previous pass and emit `instanceStateChanged` where the watched fields
    /// moved.
    pub fn poll_once(&self) {
        let runtimes: Vec<Arc<InstanceRuntime>> =
            self.instances.read().values().cloned().collect();
        let mut last_poll = self.last_poll.lock();

        for runtime in runtimes {
            let state = runtime.get_state();
            if state.status != InstanceStatus::Running {
                last_poll.remove(&state.id);
                continue;
            }

            let changed = last_poll
                .get(&state.id)
                .map(|previous| previous.poll_changed(&state))
                .unwrap_or(true);

            if changed {
                if let Ok(value) = serde_json::to_value(&state) {
                    self.events.publish(EngineEvent::InstanceStateChanged {
                        instance_id: state.id.clone(),
                        state: value,
                    });
                }
                last_poll.insert(state.id.clone(), state);
            }
        }
    }

    /// Spawn the 1-second polling loop.
    pub fn spawn_state_poller(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(POLL_INTERVAL_MS));
            loop {
                interval.tick().await;
                manager.poll_once();
            }
        })
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn persist_instances(&self) -> EngineResult<()> {
        self.store.save_instances(&self.get_all_configs())
    }
}
