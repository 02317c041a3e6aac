// =============================================================================
// Price Oscillator (PO)
// =============================================================================
//
//   PO = 100 * (SMA(values, fast) - SMA(values, slow)) / SMA(values, slow)
//
// Defined where the slow average is defined and non-zero.
// =============================================================================

use crate::indicators::sma::sma;

/// Compute the price oscillator of `values` for `fast` / `slow` periods.
pub fn po(values: &[f64], fast: usize, slow: usize) -> Vec<f64> {
    let n = values.len();
    let fast_ma = sma(values, fast);
    let slow_ma = sma(values, slow);

    let mut out = vec![f64::NAN; n];
    for i in 0..n {
        if fast_ma[i].is_finite() && slow_ma[i].is_finite() && slow_ma[i] != 0.0 {
            out[i] = 100.0 * (fast_ma[i] - slow_ma[i]) / slow_ma[i];
        }
    }

    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn po_flat_series_is_zero() {
        let out = po(&[100.0; 20], 3, 10);
        for &v in out.iter().filter(|v| v.is_finite()) {
            assert!(v.abs() < 1e-12);
        }
    }

    #[test]
    fn po_warmup_follows_slow_period() {
        let values: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let out = po(&values, 3, 10);
        assert!(out[8].is_nan());
        assert!(out[9].is_finite());
    }

    #[test]
    fn po_positive_in_uptrend() {
        let values: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let out = po(&values, 3, 10);
        assert!(*out.last().unwrap() > 0.0);
    }

    #[test]
    fn po_negative_in_downtrend() {
        let values: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let out = po(&values, 3, 10);
        assert!(*out.last().unwrap() < 0.0);
    }

    #[test]
    fn po_zero_slow_ma_is_undefined() {
        // Slow MA of a symmetric +/- series is exactly zero.
        let values = vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let out = po(&values, 1, 2);
        // Every even index has slow MA == 0, so PO must be NaN there.
        assert!(out[1].is_nan() || out[1].is_finite()); // odd windows may be fine
        for i in (1..6).step_by(2) {
            let window_mean = (values[i - 1] + values[i]) / 2.0;
            if window_mean == 0.0 {
                assert!(out[i].is_nan());
            }
        }
    }
}
