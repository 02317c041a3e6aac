// =============================================================================
// Algorithm model — declarative indicator + condition definitions
// =============================================================================
//
// An Algorithm is pure data: an ordered list of indicator specs and two
// ordered condition lists (entry, exit). It is validated once at load time so
// the condition engine can assume every referenced indicator name resolves.
// Documents are stored as camelCase JSON to stay shape-compatible with the
// dashboard.
// =============================================================================

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::indicators::{IndicatorKind, ParamBag};
use crate::market::series::PriceSource;
use crate::types::ConditionSide;

// ---------------------------------------------------------------------------
// Indicator spec
// ---------------------------------------------------------------------------

/// One configured indicator within an algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: IndicatorKind,
    #[serde(default)]
    pub parameters: ParamBag,
    #[serde(default)]
    pub description: String,
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Predicate family of a trading condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    #[serde(rename = "threshold")]
    Threshold,
    #[serde(rename = "crossover")]
    Crossover,
    #[serde(rename = "slope")]
    Slope,
    #[serde(rename = "position-pnl")]
    PositionPnl,
}

/// How consecutive conditions combine. Entry lists are AND-aggregated; the
/// operator is carried per condition for document compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    And,
    Or,
}

impl Default for LogicalOperator {
    fn default() -> Self {
        Self::And
    }
}

/// One entry or exit condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSpec {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    #[serde(default)]
    pub side: ConditionSide,
    #[serde(default)]
    pub symmetric: bool,
    #[serde(default)]
    pub parameters: ParamBag,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
}

impl ConditionSpec {
    /// Indicator names this condition reads.
    pub fn referenced_indicators(&self) -> Vec<&str> {
        ["indicator", "indicator1", "indicator2"]
            .iter()
            .filter_map(|key| self.parameters.get(*key).and_then(|v| v.as_str()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Algorithm
// ---------------------------------------------------------------------------

/// A complete, named trading algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Algorithm {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub indicators: Vec<IndicatorSpec>,
    #[serde(default)]
    pub entry_conditions: Vec<ConditionSpec>,
    #[serde(default)]
    pub exit_conditions: Vec<ConditionSpec>,
    #[serde(default = "Utc::now")]
    pub created_time: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_modified_time: DateTime<Utc>,
    #[serde(default)]
    pub favorite: bool,
}

fn default_version() -> String {
    "1".to_string()
}

impl Algorithm {
    /// Every indicator name this algorithm produces, including the derived
    /// MACD signal/histogram names.
    pub fn indicator_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        for spec in &self.indicators {
            names.insert(spec.name.clone());
            for derived in spec.kind.derived_names(&spec.name) {
                names.insert(derived);
            }
        }
        names
    }

    /// Validate structural integrity: non-empty unique name, unique indicator
    /// names, and every condition reference resolving to a produced name.
    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("algorithm name is empty".into()));
        }

        let mut seen = HashSet::new();
        for spec in &self.indicators {
            if spec.name.trim().is_empty() {
                return Err(EngineError::Validation(
                    "indicator with empty name".into(),
                ));
            }
            if !seen.insert(spec.name.clone()) {
                return Err(EngineError::Validation(format!(
                    "duplicate indicator name '{}'",
                    spec.name
                )));
            }
            for derived in spec.kind.derived_names(&spec.name) {
                if !seen.insert(derived.clone()) {
                    return Err(EngineError::Validation(format!(
                        "derived indicator name '{derived}' collides"
                    )));
                }
            }
        }

        // Indicator inputs that name other indicators must reference an
        // earlier spec (or its derived names) so compute order is well defined.
        let mut available: HashSet<String> = HashSet::new();
        for spec in &self.indicators {
            for key in ["source", "source1", "source2"] {
                if let Some(src) = spec.parameters.get(key).and_then(|v| v.as_str()) {
                    if let PriceSource::Indicator(name) = PriceSource::parse(src) {
                        if !available.contains(&name) {
                            return Err(EngineError::Validation(format!(
                                "indicator '{}' references '{name}' before it is defined",
                                spec.name
                            )));
                        }
                    }
                }
            }
            available.insert(spec.name.clone());
            for derived in spec.kind.derived_names(&spec.name) {
                available.insert(derived);
            }
        }

        let produced = self.indicator_names();
        for (list, label) in [
            (&self.entry_conditions, "entry"),
            (&self.exit_conditions, "exit"),
        ] {
            for (i, cond) in list.iter().enumerate() {
                if cond.kind == ConditionType::PositionPnl {
                    continue; // reads the live position, not an indicator
                }
                for referenced in cond.referenced_indicators() {
                    if !produced.contains(referenced) {
                        return Err(EngineError::Validation(format!(
                            "{label} condition {i} references unknown indicator '{referenced}'"
                        )));
                    }
                }
                let required = match cond.kind {
                    ConditionType::Threshold | ConditionType::Slope => vec!["indicator"],
                    ConditionType::Crossover => vec!["indicator1", "indicator2"],
                    ConditionType::PositionPnl => vec![],
                };
                for key in required {
                    if !cond.parameters.contains_key(key) {
                        return Err(EngineError::Validation(format!(
                            "{label} condition {i} missing parameter '{key}'"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Refresh the modification timestamp (call on every catalog write).
    pub fn touch(&mut self) {
        self.last_modified_time = Utc::now();
    }
}
