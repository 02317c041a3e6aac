// =============================================================================
// Condition engine — evaluates entry/exit condition lists at a bar index
// =============================================================================
//
// A condition fails (no signal, no error) when a referenced indicator is
// missing or still in warmup at the evaluated index. Symmetric conditions
// evaluate both branches: the LONG branch uses the predicate as written, the
// SHORT branch uses its mirror (flipped comparison / crossover direction,
// negated slope threshold). When both entry branches fire on the same bar,
// LONG wins.
// =============================================================================

use tracing::debug;

use crate::algorithm::{ConditionSpec, ConditionType};
use crate::errors::{EngineError, EngineResult};
use crate::indicators::{param_f64, param_str};
use crate::market::series::Series;
use crate::position::Position;
use crate::types::{ConditionSide, Side, TickSpec};

/// Absolute tolerance for `==` / `!=` comparisons.
const EQ_TOLERANCE: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Comparison operators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl Comparison {
    fn parse(s: &str) -> EngineResult<Self> {
        match s {
            ">" => Ok(Self::Gt),
            "<" => Ok(Self::Lt),
            ">=" => Ok(Self::Ge),
            "<=" => Ok(Self::Le),
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            other => Err(EngineError::Validation(format!(
                "unknown comparison operator '{other}'"
            ))),
        }
    }

    fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Ge => value >= threshold,
            Self::Le => value <= threshold,
            Self::Eq => (value - threshold).abs() <= EQ_TOLERANCE,
            Self::Ne => (value - threshold).abs() > EQ_TOLERANCE,
        }
    }

    /// The comparison the SHORT branch of a symmetric condition uses.
    fn mirrored(&self) -> Self {
        match self {
            Self::Gt => Self::Lt,
            Self::Lt => Self::Gt,
            Self::Ge => Self::Le,
            Self::Le => Self::Ge,
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

// ---------------------------------------------------------------------------
// Per-condition outcome
// ---------------------------------------------------------------------------

/// Result of evaluating one condition's two branches.
#[derive(Debug, Clone, Default)]
struct BranchOutcome {
    long_met: bool,
    short_met: bool,
    long_text: String,
    short_text: String,
}

impl BranchOutcome {
    fn single(met: bool, text: String) -> Self {
        Self {
            long_met: met,
            short_met: met,
            long_text: text.clone(),
            short_text: text,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry evaluation
// ---------------------------------------------------------------------------

/// Aggregated entry decision at one bar.
#[derive(Debug, Clone, Default)]
pub struct EntryEvaluation {
    pub long_ok: bool,
    pub short_ok: bool,
    long_text: String,
    short_text: String,
}

impl EntryEvaluation {
    /// The side the runtime should enter, with LONG preferred when both
    /// branches fire, and the matching signal text.
    pub fn decision(&self) -> Option<(Side, &str)> {
        if self.long_ok {
            Some((Side::Long, self.long_text.as_str()))
        } else if self.short_ok {
            Some((Side::Short, self.short_text.as_str()))
        } else {
            None
        }
    }
}

/// Evaluate the ordered entry-condition list at bar `i`.
///
/// Conditions combine with logical AND: an entry side is viable only when
/// every condition admits that side and its predicate for that side is met.
/// An empty list never fires.
pub fn evaluate_entry(series: &Series, conditions: &[ConditionSpec], i: usize) -> EntryEvaluation {
    if conditions.is_empty() {
        return EntryEvaluation::default();
    }

    let mut long_ok = true;
    let mut short_ok = true;
    let mut long_texts: Vec<String> = Vec::new();
    let mut short_texts: Vec<String> = Vec::new();

    for cond in conditions {
        if cond.kind == ConditionType::PositionPnl {
            // Position P&L reads the live position and belongs to the exit
            // path; in an entry list it can never be satisfied.
            debug!("position-pnl condition in entry list never fires");
            long_ok = false;
            short_ok = false;
            break;
        }

        let outcome = evaluate_branches(series, cond, i);
        long_ok &= cond.side.admits(Side::Long) && outcome.long_met;
        short_ok &= cond.side.admits(Side::Short) && outcome.short_met;
        if outcome.long_met {
            long_texts.push(outcome.long_text);
        }
        if outcome.short_met {
            short_texts.push(outcome.short_text);
        }
        if !long_ok && !short_ok {
            break;
        }
    }

    EntryEvaluation {
        long_ok,
        short_ok,
        long_text: long_texts.join("; "),
        short_text: short_texts.join("; "),
    }
}

// ---------------------------------------------------------------------------
// Exit evaluation
// ---------------------------------------------------------------------------

/// Evaluate the ordered exit-condition list at bar `i` against an open
/// position. The first condition whose predicate for the position's side is
/// met, and whose declared side admits that position, triggers the exit.
///
/// `live_price` feeds position-pnl conditions only; indicator conditions read
/// the series at `i`.
pub fn evaluate_exit(
    series: &Series,
    conditions: &[ConditionSpec],
    i: usize,
    position: &Position,
    live_price: f64,
    tick: TickSpec,
) -> Option<String> {
    if position.is_flat() {
        return None;
    }

    for cond in conditions {
        if !cond.side.admits(position.side) {
            continue;
        }

        let (met, text) = match cond.kind {
            ConditionType::PositionPnl => evaluate_position_pnl(cond, position, live_price, tick),
            _ => {
                let outcome = evaluate_branches(series, cond, i);
                match position.side {
                    Side::Long => (outcome.long_met, outcome.long_text),
                    Side::Short if cond.symmetric => (outcome.short_met, outcome.short_text),
                    Side::Short => (outcome.long_met, outcome.long_text),
                    Side::None => (false, String::new()),
                }
            }
        };

        if met {
            return Some(text);
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Predicate evaluation
// ---------------------------------------------------------------------------

/// Evaluate both branches of an indicator-driven condition. The SHORT branch
/// differs from the LONG branch only when the condition is symmetric.
fn evaluate_branches(series: &Series, cond: &ConditionSpec, i: usize) -> BranchOutcome {
    let result = match cond.kind {
        ConditionType::Threshold => threshold_branches(series, cond, i),
        ConditionType::Crossover => crossover_branches(series, cond, i),
        ConditionType::Slope => slope_branches(series, cond, i),
        ConditionType::PositionPnl => return BranchOutcome::default(),
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            // Misconfigured or still-warming indicators fail the condition
            // without erroring the whole evaluation.
            debug!(error = %e, "condition failed to evaluate");
            BranchOutcome::default()
        }
    }
}

fn threshold_branches(series: &Series, cond: &ConditionSpec, i: usize) -> EngineResult<BranchOutcome> {
    let name = param_str(&cond.parameters, "indicator")
        .ok_or_else(|| EngineError::Validation("threshold missing 'indicator'".into()))?;
    let threshold = param_f64(&cond.parameters, "threshold", 0.0)?;
    let comparison = Comparison::parse(
        param_str(&cond.parameters, "comparison").unwrap_or(">"),
    )?;

    let Some(value) = series.indicator_value(name, i) else {
        return Ok(BranchOutcome::default());
    };

    let long_met = comparison.apply(value, threshold);
    let long_text = format!("{name} ({value:.4}) {} {threshold}", comparison.symbol());

    if cond.symmetric {
        let mirrored = comparison.mirrored();
        let short_met = mirrored.apply(value, threshold);
        let short_text = format!("{name} ({value:.4}) {} {threshold}", mirrored.symbol());
        Ok(BranchOutcome {
            long_met,
            short_met,
            long_text,
            short_text,
        })
    } else {
        Ok(BranchOutcome::single(long_met, long_text))
    }
}

fn crossover_branches(series: &Series, cond: &ConditionSpec, i: usize) -> EngineResult<BranchOutcome> {
    let name1 = param_str(&cond.parameters, "indicator1")
        .ok_or_else(|| EngineError::Validation("crossover missing 'indicator1'".into()))?;
    let name2 = param_str(&cond.parameters, "indicator2")
        .ok_or_else(|| EngineError::Validation("crossover missing 'indicator2'".into()))?;
    let above = matches!(
        param_str(&cond.parameters, "direction").unwrap_or("above"),
        "above"
    );

    if i == 0 {
        return Ok(BranchOutcome::default());
    }

    let (Some(a0), Some(a1), Some(b0), Some(b1)) = (
        series.indicator_value(name1, i - 1),
        series.indicator_value(name1, i),
        series.indicator_value(name2, i - 1),
        series.indicator_value(name2, i),
    ) else {
        return Ok(BranchOutcome::default());
    };

    let crossed_above = a0 <= b0 && a1 > b1;
    let crossed_below = a0 >= b0 && a1 < b1;

    let met_for = |dir_above: bool| if dir_above { crossed_above } else { crossed_below };
    let text_for = |dir_above: bool| {
        format!(
            "{name1} crossed {} {name2}",
            if dir_above { "above" } else { "below" }
        )
    };

    let long_met = met_for(above);
    if cond.symmetric {
        let short_met = met_for(!above);
        Ok(BranchOutcome {
            long_met,
            short_met,
            long_text: text_for(above),
            short_text: text_for(!above),
        })
    } else {
        Ok(BranchOutcome::single(long_met, text_for(above)))
    }
}

fn slope_branches(series: &Series, cond: &ConditionSpec, i: usize) -> EngineResult<BranchOutcome> {
    let name = param_str(&cond.parameters, "indicator")
        .ok_or_else(|| EngineError::Validation("slope missing 'indicator'".into()))?;
    let threshold = param_f64(&cond.parameters, "threshold", 0.0)?;
    let up = matches!(param_str(&cond.parameters, "direction").unwrap_or("up"), "up");

    let Some(value) = series.indicator_value(name, i) else {
        return Ok(BranchOutcome::default());
    };

    let met_for = |dir_up: bool, thr: f64| if dir_up { value > thr } else { value < thr };
    let text_for = |dir_up: bool, thr: f64| {
        format!(
            "{name} slope {} ({value:.4} {} {thr})",
            if dir_up { "up" } else { "down" },
            if dir_up { ">" } else { "<" }
        )
    };

    let long_met = met_for(up, threshold);
    if cond.symmetric {
        // Mirror of "rising past t" is "falling past -t".
        let short_met = met_for(!up, -threshold);
        Ok(BranchOutcome {
            long_met,
            short_met,
            long_text: text_for(up, threshold),
            short_text: text_for(!up, -threshold),
        })
    } else {
        Ok(BranchOutcome::single(long_met, text_for(up, threshold)))
    }
}

fn evaluate_position_pnl(
    cond: &ConditionSpec,
    position: &Position,
    live_price: f64,
    tick: TickSpec,
) -> (bool, String) {
    let threshold = match param_f64(&cond.parameters, "threshold", 0.0) {
        Ok(t) => t,
        Err(_) => return (false, String::new()),
    };
    let comparison = match Comparison::parse(param_str(&cond.parameters, "comparison").unwrap_or("<")) {
        Ok(c) => c,
        Err(_) => return (false, String::new()),
    };

    let pnl = position.unrealized_pnl(live_price, tick);
    let met = comparison.apply(pnl, threshold);
    let text = format!("position P&L {pnl:.2} {} {threshold}", comparison.symbol());
    (met, text)
}
