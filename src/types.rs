// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of an open position. `None` means flat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    None,
    Long,
    Short,
}

impl Default for Side {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Which position side a trading condition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionSide {
    Long,
    Short,
    Both,
}

impl Default for ConditionSide {
    fn default() -> Self {
        Self::Both
    }
}

impl ConditionSide {
    /// Whether this condition side admits an entry/exit on `side`.
    pub fn admits(&self, side: Side) -> bool {
        match self {
            Self::Both => side != Side::None,
            Self::Long => side == Side::Long,
            Self::Short => side == Side::Short,
        }
    }
}

impl std::fmt::Display for ConditionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Both => write!(f, "BOTH"),
        }
    }
}

/// Lifecycle state of a live trading instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Stopped,
    Running,
    Paused,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
        }
    }
}

/// Lifecycle state of a backtest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BacktestStatus {
    Created,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl Default for BacktestStatus {
    fn default() -> Self {
        Self::Created
    }
}

impl std::fmt::Display for BacktestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Whether a signal opens or closes a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Entry,
    Exit,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "ENTRY"),
            Self::Exit => write!(f, "EXIT"),
        }
    }
}

// =============================================================================
// Tick configuration
// =============================================================================

/// Tick size and per-tick dollar value for a futures contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickSpec {
    pub tick_size: f64,
    pub tick_value: f64,
}

impl TickSpec {
    /// Dollar value of one full point of price movement.
    pub fn point_value(&self) -> f64 {
        self.tick_value / self.tick_size
    }
}

/// Look up the tick configuration for a futures symbol.
///
/// The symbol may carry an exchange prefix (e.g. `CON.F.US.ENQ.U25`); matching
/// is done on the root symbol. Unknown symbols fall back to 0.25 / 5.00.
pub fn tick_spec(symbol: &str) -> TickSpec {
    let root = symbol
        .split('.')
        .find(|part| TICK_TABLE.iter().any(|(s, ..)| s == part))
        .unwrap_or(symbol);

    for &(sym, tick_size, tick_value) in TICK_TABLE {
        if sym == root {
            return TickSpec {
                tick_size,
                tick_value,
            };
        }
    }

    TickSpec {
        tick_size: 0.25,
        tick_value: 5.00,
    }
}

/// (symbol root, tick size, tick value)
const TICK_TABLE: &[(&str, f64, f64)] = &[
    ("ENQ", 0.25, 5.00),
    ("NQ", 0.25, 5.00),
    ("MNQ", 0.25, 0.50),
    ("ES", 0.25, 12.50),
    ("MES", 0.25, 1.25),
    ("YM", 1.0, 5.00),
    ("MYM", 1.0, 0.50),
    ("RTY", 0.10, 5.00),
    ("M2K", 0.10, 0.50),
    ("CL", 0.01, 10.00),
    ("GC", 0.10, 10.00),
    ("SI", 0.005, 25.00),
];

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_spec_known_symbols() {
        assert_eq!(tick_spec("ES").tick_size, 0.25);
        assert_eq!(tick_spec("ES").tick_value, 12.50);
        assert_eq!(tick_spec("MNQ").tick_value, 0.50);
        assert_eq!(tick_spec("SI").tick_size, 0.005);
        assert_eq!(tick_spec("SI").tick_value, 25.00);
    }

    #[test]
    fn tick_spec_unknown_defaults() {
        let spec = tick_spec("ZB");
        assert_eq!(spec.tick_size, 0.25);
        assert_eq!(spec.tick_value, 5.00);
    }

    #[test]
    fn tick_spec_contract_id_prefix() {
        // Full gateway contract identifiers resolve through the root symbol.
        let spec = tick_spec("CON.F.US.ENQ.U25");
        assert_eq!(spec.tick_size, 0.25);
        assert_eq!(spec.tick_value, 5.00);

        let es = tick_spec("CON.F.US.ES.Z25");
        assert_eq!(es.tick_value, 12.50);
    }

    #[test]
    fn point_value() {
        let es = tick_spec("ES");
        assert!((es.point_value() - 50.0).abs() < 1e-9);
        let cl = tick_spec("CL");
        assert!((cl.point_value() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn side_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Side::Long).unwrap(), "\"LONG\"");
        let side: Side = serde_json::from_str("\"SHORT\"").unwrap();
        assert_eq!(side, Side::Short);
    }

    #[test]
    fn condition_side_admits() {
        assert!(ConditionSide::Both.admits(Side::Long));
        assert!(ConditionSide::Both.admits(Side::Short));
        assert!(!ConditionSide::Both.admits(Side::None));
        assert!(ConditionSide::Long.admits(Side::Long));
        assert!(!ConditionSide::Long.admits(Side::Short));
        assert!(!ConditionSide::Short.admits(Side::Long));
    }

    #[test]
    fn status_display() {
        assert_eq!(InstanceStatus::Running.to_string(), "RUNNING");
        assert_eq!(BacktestStatus::Completed.to_string(), "COMPLETED");
        assert_eq!(SignalKind::Entry.to_string(), "ENTRY");
    }
}
