// =============================================================================
// Moving Average Convergence / Divergence (MACD)
// =============================================================================
//
//   macd      = EMA(values, fast) - EMA(values, slow)
//   signal    = EMA(macd, signal_period), computed over the defined region
//   histogram = macd - signal
//
// All three output series are index-aligned with the input; the macd line is
// defined from `slow - 1`, the signal and histogram from
// `slow - 1 + signal_period - 1`.
// =============================================================================

use crate::indicators::ema::ema;

/// The three MACD output series, each the same length as the input.
#[derive(Debug, Clone)]
pub struct MacdOutput {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

/// Compute MACD with the given fast / slow / signal periods
/// (conventionally 12 / 26 / 9).
pub fn macd(values: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdOutput {
    let n = values.len();
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);

    let mut macd_line = vec![f64::NAN; n];
    for i in 0..n {
        if fast_ema[i].is_finite() && slow_ema[i].is_finite() {
            macd_line[i] = fast_ema[i] - slow_ema[i];
        }
    }

    // Signal: EMA over the defined portion of the macd line, re-aligned.
    let mut signal_line = vec![f64::NAN; n];
    if let Some(first) = macd_line.iter().position(|v| v.is_finite()) {
        let defined = &macd_line[first..];
        let sig = ema(defined, signal_period);
        for (offset, v) in sig.iter().enumerate() {
            signal_line[first + offset] = *v;
        }
    }

    let mut histogram = vec![f64::NAN; n];
    for i in 0..n {
        if macd_line[i].is_finite() && signal_line[i].is_finite() {
            histogram[i] = macd_line[i] - signal_line[i];
        }
    }

    MacdOutput {
        macd: macd_line,
        signal: signal_line,
        histogram,
    }
}
