// =============================================================================
// Technical indicators
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the engine can
// evaluate. Every function returns a series exactly as long as its input,
// with `f64::NAN` filling the positions before warmup completes, so that
// output index `i` always corresponds to bar `i`.
//
// `compute` dispatches a declarative `IndicatorSpec` against a `Series` and
// returns the named output sequence(s) — MACD contributes three.
// =============================================================================

pub mod atr;
pub mod ema;
pub mod macd;
pub mod mfi;
pub mod po;
pub mod rsi;
pub mod sd;
pub mod slope;
pub mod sma;
pub mod stochastic;
pub mod strength;
pub mod vwap;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::algorithm::IndicatorSpec;
use crate::errors::{EngineError, EngineResult};
use crate::market::series::{PriceSource, Series};

/// Every indicator type the engine can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndicatorKind {
    #[serde(rename = "SMA")]
    Sma,
    #[serde(rename = "EMA")]
    Ema,
    #[serde(rename = "RSI")]
    Rsi,
    #[serde(rename = "MACD")]
    Macd,
    #[serde(rename = "STOCHASTICK")]
    StochasticK,
    #[serde(rename = "STOCHASTICD")]
    StochasticD,
    #[serde(rename = "ATR")]
    Atr,
    #[serde(rename = "VWAP")]
    Vwap,
    #[serde(rename = "MFI")]
    Mfi,
    #[serde(rename = "SD")]
    Sd,
    #[serde(rename = "PO")]
    Po,
    #[serde(rename = "SLOPE")]
    Slope,
    #[serde(rename = "DIFFERENCE")]
    Difference,
    #[serde(rename = "STRENGTH")]
    Strength,
}

impl IndicatorKind {
    /// Derived output names this kind contributes beyond its own name.
    pub fn derived_names(&self, name: &str) -> Vec<String> {
        match self {
            Self::Macd => vec![format!("{name}_Signal"), format!("{name}_Histogram")],
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter bag access
// ---------------------------------------------------------------------------

pub type ParamBag = HashMap<String, serde_json::Value>;

/// Read an integer parameter, accepting JSON numbers or numeric strings.
pub fn param_usize(params: &ParamBag, key: &str, default: usize) -> EngineResult<usize> {
    let Some(value) = params.get(key) else {
        return Ok(default);
    };
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_u64().map(|v| v as usize),
        serde_json::Value::String(s) => s.trim().parse::<usize>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        EngineError::Validation(format!("parameter '{key}' must be a non-negative integer"))
    })
}

/// Read a float parameter, accepting JSON numbers or numeric strings.
pub fn param_f64(params: &ParamBag, key: &str, default: f64) -> EngineResult<f64> {
    let Some(value) = params.get(key) else {
        return Ok(default);
    };
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| EngineError::Validation(format!("parameter '{key}' must be a number")))
}

/// Read a string parameter.
pub fn param_str<'a>(params: &'a ParamBag, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

/// Read the input selector for a price-driven indicator (default `close`).
fn param_source(params: &ParamBag, key: &str) -> PriceSource {
    param_str(params, key)
        .map(PriceSource::parse)
        .unwrap_or(PriceSource::Close)
}

fn required_source(params: &ParamBag, key: &str, kind: &str) -> EngineResult<PriceSource> {
    param_str(params, key)
        .map(PriceSource::parse)
        .ok_or_else(|| EngineError::Validation(format!("{kind} requires parameter '{key}'")))
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Compute one indicator spec against `series`, returning its named output
/// sequence(s) in storage order.
pub fn compute(series: &Series, spec: &IndicatorSpec) -> EngineResult<Vec<(String, Vec<f64>)>> {
    let params = &spec.parameters;
    let name = spec.name.clone();

    let outputs = match spec.kind {
        IndicatorKind::Sma => {
            let source = series.price_data(&param_source(params, "source"))?;
            let period = param_usize(params, "period", 14)?;
            vec![(name, sma::sma(&source, period))]
        }
        IndicatorKind::Ema => {
            let source = series.price_data(&param_source(params, "source"))?;
            let period = param_usize(params, "period", 14)?;
            vec![(name, ema::ema(&source, period))]
        }
        IndicatorKind::Rsi => {
            let source = series.price_data(&param_source(params, "source"))?;
            let period = param_usize(params, "period", 14)?;
            vec![(name, rsi::rsi(&source, period))]
        }
        IndicatorKind::Macd => {
            let source = series.price_data(&param_source(params, "source"))?;
            let fast = param_usize(params, "fast", 12)?;
            let slow = param_usize(params, "slow", 26)?;
            let signal = param_usize(params, "signal", 9)?;
            let out = macd::macd(&source, fast, slow, signal);
            vec![
                (format!("{name}_Signal"), out.signal),
                (format!("{name}_Histogram"), out.histogram),
                (name, out.macd),
            ]
        }
        IndicatorKind::StochasticK => {
            let period = param_usize(params, "period", 14)?;
            let out = stochastic::stochastic_k(
                series.highs(),
                series.lows(),
                series.closes(),
                period,
            );
            vec![(name, out)]
        }
        IndicatorKind::StochasticD => {
            // %D smooths an already-computed %K sequence referenced by name.
            let source = required_source(params, "source", "STOCHASTICD")?;
            let k = series.price_data(&source)?;
            let period = param_usize(params, "period", 3)?;
            vec![(name, stochastic::stochastic_d(&k, period))]
        }
        IndicatorKind::Atr => {
            let period = param_usize(params, "period", 14)?;
            let out = atr::atr(series.highs(), series.lows(), series.closes(), period);
            vec![(name, out)]
        }
        IndicatorKind::Vwap => {
            let out = vwap::vwap(
                series.highs(),
                series.lows(),
                series.closes(),
                series.volumes(),
            );
            vec![(name, out)]
        }
        IndicatorKind::Mfi => {
            let period = param_usize(params, "period", 14)?;
            let out = mfi::mfi(
                series.highs(),
                series.lows(),
                series.closes(),
                series.volumes(),
                period,
            );
            vec![(name, out)]
        }
        IndicatorKind::Sd => {
            let source = series.price_data(&param_source(params, "source"))?;
            let period = param_usize(params, "period", 14)?;
            vec![(name, sd::sd(&source, period))]
        }
        IndicatorKind::Po => {
            let source = series.price_data(&param_source(params, "source"))?;
            let fast = param_usize(params, "fast", 12)?;
            let slow = param_usize(params, "slow", 26)?;
            vec![(name, po::po(&source, fast, slow))]
        }
        IndicatorKind::Slope => {
            let source = series.price_data(&param_source(params, "source"))?;
            let lookback = param_usize(params, "lookback", 1)?;
            vec![(name, slope::slope(&source, lookback))]
        }
        IndicatorKind::Difference => {
            let a = series.price_data(&required_source(params, "source1", "DIFFERENCE")?)?;
            let b = series.price_data(&required_source(params, "source2", "DIFFERENCE")?)?;
            vec![(name, slope::difference(&a, &b))]
        }
        IndicatorKind::Strength => {
            let source = series.price_data(&param_source(params, "source"))?;
            let period = param_usize(params, "period", 14)?;
            vec![(name, strength::strength(&source, period))]
        }
    };

    Ok(outputs)
}

/// Compute every indicator of `algorithm` in declaration order and store the
/// results into `series`. Later specs may reference the sequences produced by
/// earlier ones.
pub fn compute_all(series: &mut Series, specs: &[IndicatorSpec]) -> EngineResult<()> {
    for spec in specs {
        let outputs = compute(series, spec)?;
        for (output_name, seq) in outputs {
            series.set_indicator(output_name, seq)?;
        }
    }
    Ok(())
}
