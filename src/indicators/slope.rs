// =============================================================================
// Slope and Difference
// =============================================================================
//
//   Slope(values, lookback)_i = values[i] - values[i - lookback]
//   Difference(a, b)_i        = a[i] - b[i]
//
// Slope is defined from index `lookback`; Difference wherever both inputs
// are defined.
// =============================================================================

/// Change of `values` over `lookback` positions.
pub fn slope(values: &[f64], lookback: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if lookback == 0 || lookback >= n {
        return out;
    }

    for i in lookback..n {
        out[i] = values[i] - values[i - lookback];
    }

    out
}

/// Element-wise `a - b`. Mismatched lengths yield an all-NaN series sized to
/// the longer input so alignment with the series is preserved.
pub fn difference(a: &[f64], b: &[f64]) -> Vec<f64> {
    if a.len() != b.len() {
        return vec![f64::NAN; a.len().max(b.len())];
    }
    a.iter().zip(b.iter()).map(|(x, y)| x - y).collect()
}
