// =============================================================================
// Strength — directional pressure over a rolling window
// =============================================================================
//
// Over the last `period` one-step changes:
//
//   Strength = 100 * Σgains / (Σgains + Σlosses)
//
// where gains and losses are the absolute magnitudes of up and down moves.
// A window with no movement at all emits 50 (neutral).
// =============================================================================

/// Compute the strength series of `values` over `period` one-step changes.
///
/// Each window needs `period` changes, each requiring a previous sample, so
/// the output is defined from index `period`.
pub fn strength(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    for i in period..n {
        let mut gains = 0.0;
        let mut losses = 0.0;
        for j in (i + 1 - period)..=i {
            let delta = values[j] - values[j - 1];
            if delta > 0.0 {
                gains += delta;
            } else {
                losses += -delta;
            }
        }

        let total = gains + losses;
        out[i] = if total == 0.0 {
            50.0
        } else {
            100.0 * gains / total
        };
    }

    out
}
