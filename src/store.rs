// =============================================================================
// Document store — file-backed JSON persistence
// =============================================================================
//
// Layout under the data directory:
//
//   algorithms/<name>.json       one Algorithm per file, name is the key
//   instances.json               { instances: [...], lastSaved }
//   backtests/<id>.json          BacktestDefinition
//   backtest-results.json        completed BacktestSnapshot array
//   historical/<symbol>-<YYYY-MM-DD>.json   one UTC day of 1-minute bars
//   connection.json              broker credentials + autoconnect
//
// Every write is whole-file atomic (tmp + rename). Corrupt documents are
// skipped with a warning rather than failing the whole load.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::algorithm::Algorithm;
use crate::backtest::{BacktestDefinition, BacktestSnapshot};
use crate::config::{load_json, save_json, ConnectionConfig};
use crate::errors::{EngineError, EngineResult};
use crate::market::series::Bar;
use crate::runtime::InstanceConfig;

/// Wrapper document for `instances.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstancesDocument {
    #[serde(default)]
    instances: Vec<InstanceConfig>,
    last_saved: DateTime<Utc>,
}

pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> EngineResult<Self> {
        let root = root.into();
        for sub in ["algorithms", "backtests", "historical"] {
            std::fs::create_dir_all(root.join(sub)).map_err(|e| {
                EngineError::Internal(format!(
                    "cannot create data directory {}: {e}",
                    root.join(sub).display()
                ))
            })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // -------------------------------------------------------------------------
    // Algorithms
    // -------------------------------------------------------------------------

    /// The algorithm name doubles as the filename, so restrict it to
    /// filesystem-safe characters.
    pub fn check_algorithm_name(name: &str) -> EngineResult<()> {
        let ok = !name.is_empty()
            && name.len() <= 100
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ' | '.'));
        if ok {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "algorithm name '{name}' is not filesystem-safe"
            )))
        }
    }

    fn algorithm_path(&self, name: &str) -> PathBuf {
        self.root.join("algorithms").join(format!("{name}.json"))
    }

    pub fn save_algorithm(&self, algorithm: &Algorithm) -> EngineResult<()> {
        Self::check_algorithm_name(&algorithm.name)?;
        save_json(&self.algorithm_path(&algorithm.name), algorithm)
            .map_err(|e| EngineError::Internal(format!("saving algorithm: {e:#}")))
    }

    pub fn load_algorithms(&self) -> Vec<Algorithm> {
        let dir = self.root.join("algorithms");
        let mut algorithms = Vec::new();

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot list algorithms");
                return algorithms;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_json::<Algorithm>(&path) {
                Ok(algorithm) => {
                    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                    if stem != algorithm.name {
                        warn!(
                            path = %path.display(),
                            name = %algorithm.name,
                            "algorithm file name does not match its name field — skipped"
                        );
                        continue;
                    }
                    algorithms.push(algorithm);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "corrupt algorithm skipped"),
            }
        }

        algorithms.sort_by(|a, b| a.name.cmp(&b.name));
        algorithms
    }

    pub fn delete_algorithm(&self, name: &str) -> EngineResult<()> {
        Self::check_algorithm_name(name)?;
        let path = self.algorithm_path(name);
        if !path.exists() {
            return Err(EngineError::not_found("algorithm", name));
        }
        std::fs::remove_file(&path)
            .map_err(|e| EngineError::Internal(format!("deleting algorithm: {e}")))
    }

    // -------------------------------------------------------------------------
    // Instances
    // -------------------------------------------------------------------------

    pub fn save_instances(&self, instances: &[InstanceConfig]) -> EngineResult<()> {
        let doc = InstancesDocument {
            instances: instances.to_vec(),
            last_saved: Utc::now(),
        };
        save_json(&self.root.join("instances.json"), &doc)
            .map_err(|e| EngineError::Internal(format!("saving instances: {e:#}")))
    }

    pub fn load_instances(&self) -> Vec<InstanceConfig> {
        let path = self.root.join("instances.json");
        if !path.exists() {
            return Vec::new();
        }
        match load_json::<InstancesDocument>(&path) {
            Ok(doc) => doc.instances,
            Err(e) => {
                warn!(error = %e, "corrupt instances.json — starting empty");
                Vec::new()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Backtest definitions and results
    // -------------------------------------------------------------------------

    fn backtest_path(&self, id: &str) -> PathBuf {
        self.root.join("backtests").join(format!("{id}.json"))
    }

    pub fn save_backtest(&self, definition: &BacktestDefinition) -> EngineResult<()> {
        save_json(&self.backtest_path(&definition.id), definition)
            .map_err(|e| EngineError::Internal(format!("saving backtest: {e:#}")))
    }

    pub fn load_backtest(&self, id: &str) -> Option<BacktestDefinition> {
        let path = self.backtest_path(id);
        if !path.exists() {
            return None;
        }
        match load_json(&path) {
            Ok(definition) => Some(definition),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt backtest skipped");
                None
            }
        }
    }

    pub fn load_backtests(&self) -> Vec<BacktestDefinition> {
        let dir = self.root.join("backtests");
        let mut definitions = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match load_json::<BacktestDefinition>(&path) {
                    Ok(definition) => definitions.push(definition),
                    Err(e) => warn!(path = %path.display(), error = %e, "corrupt backtest skipped"),
                }
            }
        }
        definitions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        definitions
    }

    pub fn delete_backtest(&self, id: &str) -> EngineResult<()> {
        let path = self.backtest_path(id);
        if !path.exists() {
            return Err(EngineError::not_found("backtest", id));
        }
        std::fs::remove_file(&path)
            .map_err(|e| EngineError::Internal(format!("deleting backtest: {e}")))
    }

    pub fn save_backtest_results(&self, results: &[BacktestSnapshot]) -> EngineResult<()> {
        save_json(&self.root.join("backtest-results.json"), &results)
            .map_err(|e| EngineError::Internal(format!("saving backtest results: {e:#}")))
    }

    pub fn load_backtest_results(&self) -> Vec<BacktestSnapshot> {
        let path = self.root.join("backtest-results.json");
        if !path.exists() {
            return Vec::new();
        }
        match load_json(&path) {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "corrupt backtest-results.json — starting empty");
                Vec::new()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Historical day files
    // -------------------------------------------------------------------------

    fn historical_path(&self, symbol: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join("historical")
            .join(format!("{symbol}-{}.json", date.format("%Y-%m-%d")))
    }

    pub fn save_historical_day(
        &self,
        symbol: &str,
        date: NaiveDate,
        bars: &[Bar],
    ) -> EngineResult<()> {
        save_json(&self.historical_path(symbol, date), &bars)
            .map_err(|e| EngineError::Internal(format!("saving historical day: {e:#}")))
    }

    pub fn load_historical_day(&self, symbol: &str, date: NaiveDate) -> Option<Vec<Bar>> {
        let path = self.historical_path(symbol, date);
        if !path.exists() {
            return None;
        }
        match load_json(&path) {
            Ok(bars) => Some(bars),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt historical day skipped");
                None
            }
        }
    }

    /// Ordered bars for every stored day in `[start, end]` (inclusive dates).
    pub fn load_historical_range(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<Bar> {
        let mut bars = Vec::new();
        let mut date = start;
        while date <= end {
            if let Some(mut day) = self.load_historical_day(symbol, date) {
                bars.append(&mut day);
            }
            let Some(next) = date.succ_opt() else { break };
            date = next;
        }
        bars.sort_by_key(|b| b.timestamp);
        bars
    }

    pub fn list_historical_days(&self, symbol: &str) -> Vec<NaiveDate> {
        let prefix = format!("{symbol}-");
        let mut dates = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.root.join("historical")) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(stem) = name.strip_suffix(".json") else { continue };
                let Some(date_part) = stem.strip_prefix(&prefix) else { continue };
                if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
                    dates.push(date);
                }
            }
        }
        dates.sort();
        dates
    }

    /// Delete one day, or every stored day for `symbol` when `date` is None.
    pub fn delete_historical(&self, symbol: &str, date: Option<NaiveDate>) -> EngineResult<usize> {
        let days = match date {
            Some(date) => vec![date],
            None => self.list_historical_days(symbol),
        };

        let mut deleted = 0;
        for day in days {
            let path = self.historical_path(symbol, day);
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|e| EngineError::Internal(format!("deleting historical day: {e}")))?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    pub fn save_connection(&self, config: &ConnectionConfig) -> EngineResult<()> {
        save_json(&self.root.join("connection.json"), config)
            .map_err(|e| EngineError::Internal(format!("saving connection: {e:#}")))
    }

    pub fn load_connection(&self) -> ConnectionConfig {
        let path = self.root.join("connection.json");
        if !path.exists() {
            return ConnectionConfig::default();
        }
        match load_json(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "corrupt connection.json — using defaults");
                ConnectionConfig::default()
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn open_temp_store() -> (DocumentStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("meridian-store-{}", Uuid::new_v4()));
        let store = DocumentStore::open(&dir).unwrap();
        (store, dir)
    }

    fn sample_algorithm(name: &str) -> Algorithm {
        serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
    }

    fn sample_instance(name: &str) -> InstanceConfig {
        InstanceConfig {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            symbol: "ENQ".into(),
            contract_id: "CON.F.US.ENQ.U25".into(),
            account_id: "acct".into(),
            algorithm_name: "algo".into(),
            simulation_mode: true,
            starting_capital: 10_000.0,
            commission: 2.0,
        }
    }

    fn sample_bar(minute: i64) -> Bar {
        Bar {
            timestamp: Utc.timestamp_opt(1_750_000_020 + minute * 60, 0).unwrap(),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 7,
        }
    }

    #[test]
    fn algorithm_round_trip_and_delete() {
        let (store, dir) = open_temp_store();

        let algorithm = sample_algorithm("momentum-v1");
        store.save_algorithm(&algorithm).unwrap();

        let loaded = store.load_algorithms();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "momentum-v1");

        store.delete_algorithm("momentum-v1").unwrap();
        assert!(store.load_algorithms().is_empty());
        assert_eq!(
            store.delete_algorithm("momentum-v1").unwrap_err().code(),
            "NOT_FOUND"
        );

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn unsafe_algorithm_names_rejected() {
        assert!(DocumentStore::check_algorithm_name("ok-name_1.2").is_ok());
        assert!(DocumentStore::check_algorithm_name("../escape").is_err());
        assert!(DocumentStore::check_algorithm_name("slash/name").is_err());
        assert!(DocumentStore::check_algorithm_name("").is_err());
    }

    #[test]
    fn mismatched_algorithm_filename_skipped() {
        let (store, dir) = open_temp_store();

        // Write a file whose name does not match the document's name field.
        let algorithm = sample_algorithm("real-name");
        crate::config::save_json(
            &store.root().join("algorithms").join("wrong-name.json"),
            &algorithm,
        )
        .unwrap();

        assert!(store.load_algorithms().is_empty());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn instances_round_trip() {
        let (store, dir) = open_temp_store();
        assert!(store.load_instances().is_empty());

        let instances = vec![sample_instance("one"), sample_instance("two")];
        store.save_instances(&instances).unwrap();

        let loaded = store.load_instances();
        assert_eq!(loaded, instances);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn backtest_definitions_round_trip() {
        let (store, dir) = open_temp_store();

        let definition = BacktestDefinition {
            id: Uuid::new_v4().to_string(),
            name: "bt".into(),
            symbol: "ES".into(),
            algorithm_name: "algo".into(),
            start_date: Utc.timestamp_opt(1_750_000_000, 0).unwrap(),
            end_date: Utc.timestamp_opt(1_750_100_000, 0).unwrap(),
            lag_ticks: 2,
            created_at: Utc::now(),
            last_modified_at: Utc::now(),
        };
        store.save_backtest(&definition).unwrap();

        assert_eq!(store.load_backtests().len(), 1);
        let loaded = store.load_backtest(&definition.id).unwrap();
        assert_eq!(loaded, definition);

        store.delete_backtest(&definition.id).unwrap();
        assert!(store.load_backtest(&definition.id).is_none());

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn historical_days_round_trip_and_range() {
        let (store, dir) = open_temp_store();
        let d1 = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();
        let d3 = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap(); // gap at 3/4

        store.save_historical_day("ENQ", d1, &[sample_bar(0), sample_bar(1)]).unwrap();
        store.save_historical_day("ENQ", d2, &[sample_bar(2)]).unwrap();
        store.save_historical_day("ENQ", d3, &[sample_bar(3)]).unwrap();
        store.save_historical_day("ES", d1, &[sample_bar(4)]).unwrap();

        assert_eq!(store.list_historical_days("ENQ"), vec![d1, d2, d3]);

        let range = store.load_historical_range("ENQ", d1, d2);
        assert_eq!(range.len(), 3);
        assert!(range.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        // Delete one day, then the rest.
        assert_eq!(store.delete_historical("ENQ", Some(d2)).unwrap(), 1);
        assert_eq!(store.delete_historical("ENQ", None).unwrap(), 2);
        assert!(store.list_historical_days("ENQ").is_empty());
        assert_eq!(store.list_historical_days("ES").len(), 1);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn connection_defaults_when_missing() {
        let (store, dir) = open_temp_store();
        let config = store.load_connection();
        assert!(!config.autoconnect);

        let saved = ConnectionConfig {
            username: "u".into(),
            api_key: "k".into(),
            autoconnect: true,
            ..Default::default()
        };
        store.save_connection(&saved).unwrap();
        assert_eq!(store.load_connection(), saved);

        std::fs::remove_dir_all(dir).ok();
    }
}
