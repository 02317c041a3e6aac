// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
// Step 1 — one-step gains and losses from consecutive samples.
// Step 2 — seed average gain / loss with the mean of the first `period`
//          differences.
// Step 3 — Wilder smoothing:
//            avg = (avg * (period - 1) + current) / period
// Step 4 — RSI = 100 - 100 / (1 + avg_gain / avg_loss)
//
// When the average loss is zero the RSI is emitted as 100.
// =============================================================================

/// Compute the RSI series for `values` with look-back `period`.
///
/// The output has the same length as `values`. The first defined value sits
/// at index `period` (the seed consumes the first `period` differences).
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    let period_f = period as f64;

    // Seed averages over the first `period` differences.
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = values[i] - values[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    avg_gain /= period_f;
    avg_loss /= period_f;
    out[period] = rsi_from_averages(avg_gain, avg_loss);

    // Wilder smoothing for the remainder.
    for i in (period + 1)..n {
        let delta = values[i] - values[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        out[i] = rsi_from_averages(avg_gain, avg_loss);
    }

    out
}

/// RSI from smoothed averages; zero average loss maps to 100.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
