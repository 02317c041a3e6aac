// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
// Arithmetic mean of the last `period` samples. Defined from index
// `period - 1` onward; earlier positions are NaN so the output stays
// index-aligned with its input.
// =============================================================================

/// Compute the SMA series for `values` with look-back `period`.
///
/// The output has the same length as `values`; positions before warmup are
/// `NaN`. A `period` of zero or longer than the input yields an all-NaN
/// series.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || period > n {
        return out;
    }

    // Direct window sums. A NaN input poisons exactly the windows that
    // contain it, which is the alignment contract we want.
    for i in (period - 1)..n {
        let window = &values[i + 1 - period..=i];
        out[i] = window.iter().sum::<f64>() / period as f64;
    }

    out
}
