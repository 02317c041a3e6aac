// =============================================================================
// Stochastic Oscillator (%K and %D)
// =============================================================================
//
//   %K = 100 * (close - lowest_low(p)) / (highest_high(p) - lowest_low(p))
//   %D = SMA(%K, d)
//
// A zero high-low range emits 50 (mid-scale) rather than dividing by zero.
// =============================================================================

use crate::indicators::sma::sma;

/// Compute %K over `period` bars of highs / lows / closes.
///
/// All three slices must be the same length; the output is index-aligned and
/// defined from `period - 1`.
pub fn stochastic_k(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || period > n || highs.len() != n || lows.len() != n {
        return out;
    }

    for i in (period - 1)..n {
        let window = (i + 1 - period)..=i;
        let hh = highs[window.clone()]
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        let ll = lows[window].iter().cloned().fold(f64::INFINITY, f64::min);

        let range = hh - ll;
        out[i] = if range == 0.0 {
            50.0
        } else {
            100.0 * (closes[i] - ll) / range
        };
    }

    out
}

/// Smooth a %K series into %D. NaN warmup positions in `k` propagate, so the
/// output is defined from `k_warmup + d_period - 1`.
pub fn stochastic_d(k: &[f64], d_period: usize) -> Vec<f64> {
    sma(k, d_period)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let closes: Vec<f64> = vec![10.0, 12.0, 11.0, 14.0, 13.0, 15.0, 16.0, 14.0];
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        (highs, lows, closes)
    }

    #[test]
    fn k_warmup_prefix() {
        let (h, l, c) = fixture();
        let k = stochastic_k(&h, &l, &c, 3);
        assert!(k[0].is_nan());
        assert!(k[1].is_nan());
        assert!(k[2].is_finite());
    }

    #[test]
    fn k_range_bounds() {
        let (h, l, c) = fixture();
        let k = stochastic_k(&h, &l, &c, 3);
        for &v in k.iter().filter(|v| v.is_finite()) {
            assert!((0.0..=100.0).contains(&v), "%K {v} out of range");
        }
    }

    #[test]
    fn k_at_window_high() {
        // Close equal to the window high => %K at its maximum for the window.
        let highs = vec![10.0, 11.0, 12.0];
        let lows = vec![8.0, 9.0, 10.0];
        let closes = vec![9.0, 10.0, 12.0];
        let k = stochastic_k(&highs, &lows, &closes, 3);
        assert!((k[2] - 100.0).abs() < 1e-10);
    }

    #[test]
    fn k_zero_range_emits_midscale() {
        let flat = vec![100.0; 5];
        let k = stochastic_k(&flat, &flat, &flat, 3);
        for &v in k.iter().filter(|v| v.is_finite()) {
            assert!((v - 50.0).abs() < 1e-10);
        }
    }

    #[test]
    fn k_mismatched_lengths_all_nan() {
        let k = stochastic_k(&[1.0, 2.0], &[1.0], &[1.0, 2.0], 2);
        assert!(k.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn d_smooths_k_with_combined_warmup() {
        let (h, l, c) = fixture();
        let k = stochastic_k(&h, &l, &c, 3);
        let d = stochastic_d(&k, 3);

        // K defined from 2, D needs 3 K values => defined from 4.
        assert!(d[3].is_nan());
        assert!(d[4].is_finite());
        let expected = (k[2] + k[3] + k[4]) / 3.0;
        assert!((d[4] - expected).abs() < 1e-10);
    }
}
