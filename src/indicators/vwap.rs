// =============================================================================
// Volume-Weighted Average Price (VWAP)
// =============================================================================
//
//   VWAP_i = Σ_{j<=i} (typical_j * volume_j) / Σ_{j<=i} volume_j
//   typical = (high + low + close) / 3
//
// Reset policy: cumulative over the whole series, never reset. The live feed
// carries a single session's bars, so a daily reset would be a no-op there;
// backtests over multi-day ranges treat the range as one accumulation window.
// Positions with zero cumulative volume are NaN.
// =============================================================================

/// Compute the cumulative VWAP series over highs / lows / closes / volumes.
pub fn vwap(highs: &[f64], lows: &[f64], closes: &[f64], volumes: &[u64]) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if highs.len() != n || lows.len() != n || volumes.len() != n {
        return out;
    }

    let mut cum_pv = 0.0;
    let mut cum_v = 0.0;
    for i in 0..n {
        let typical = (highs[i] + lows[i] + closes[i]) / 3.0;
        cum_pv += typical * volumes[i] as f64;
        cum_v += volumes[i] as f64;
        if cum_v > 0.0 {
            out[i] = cum_pv / cum_v;
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
    fn vwap_single_bar_is_typical_price() {
        let out = vwap(&[12.0], &[8.0], &[10.0], &[100]);
        assert!((out[0] - 10.0).abs() < 1e-10);
    }

    #[test]
    fn vwap_weights_by_volume() {
        // Bar 1: typical 10 @ vol 100; bar 2: typical 20 @ vol 300.
        let out = vwap(&[11.0, 21.0], &[9.0, 19.0], &[10.0, 20.0], &[100, 300]);
        let expected = (10.0 * 100.0 + 20.0 * 300.0) / 400.0;
        assert!((out[1] - expected).abs() < 1e-10);
    }

    #[test]
    fn vwap_zero_volume_prefix_is_nan() {
        let out = vwap(
            &[11.0, 11.0, 11.0],
            &[9.0, 9.0, 9.0],
            &[10.0, 10.0, 10.0],
            &[0, 0, 50],
        );
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert!((out[2] - 10.0).abs() < 1e-10);
    }

    #[test]
    fn vwap_is_cumulative_not_windowed() {
        // The early heavy-volume bar keeps pulling the VWAP long after.
        let n = 20;
        let highs = vec![101.0; n];
        let lows = vec![99.0; n];
        let mut closes = vec![100.0; n];
        let mut volumes = vec![1u64; n];
        volumes[0] = 10_000;
        closes[0] = 100.0;
        for (i, c) in closes.iter_mut().enumerate().skip(1) {
            *c = 200.0 + i as f64;
        }

        let out = vwap(&highs, &lows, &closes, &volumes);
        // Cumulative VWAP stays anchored near the heavy first bar.
        assert!(*out.last().unwrap() < 110.0);
    }

    #[test]
    fn vwap_mismatched_lengths_all_nan() {
        let out = vwap(&[1.0], &[1.0, 2.0], &[1.0], &[1]);
        assert!(out.iter().all(|v| v.is_nan()));
    }
}
