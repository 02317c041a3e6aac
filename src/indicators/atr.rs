// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the Wilder-smoothed average of TR:
//   ATR_seed = mean of the first `period` TR values
//   ATR_t    = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// TR needs a previous close, so the first TR sits at index 1 and the first
// ATR at index `period`.
// =============================================================================

/// Compute the ATR series over `period` bars of highs / lows / closes.
///
/// Output is index-aligned with the inputs and defined from index `period`.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 || highs.len() != n || lows.len() != n {
        return out;
    }

    let true_range = |i: usize| -> f64 {
        let hl = highs[i] - lows[i];
        let hc = (highs[i] - closes[i - 1]).abs();
        let lc = (lows[i] - closes[i - 1]).abs();
        hl.max(hc).max(lc)
    };

    // Seed with the mean of TR[1..=period].
    let mut seed = 0.0;
    for i in 1..=period {
        seed += true_range(i);
    }
    let mut value = seed / period as f64;
    out[period] = value;

    let period_f = period as f64;
    for i in (period + 1)..n {
        value = (value * (period_f - 1.0) + true_range(i)) / period_f;
        out[i] = value;
    }

    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bars(specs: &[(f64, f64, f64)]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let highs = specs.iter().map(|s| s.0).collect();
        let lows = specs.iter().map(|s| s.1).collect();
        let closes = specs.iter().map(|s| s.2).collect();
        (highs, lows, closes)
    }

    #[test]
    fn atr_period_zero_all_nan() {
        let (h, l, c) = bars(&[(105.0, 95.0, 100.0); 10]);
        assert!(atr(&h, &l, &c, 0).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn atr_insufficient_data_all_nan() {
        let (h, l, c) = bars(&[(105.0, 95.0, 100.0); 10]);
        assert!(atr(&h, &l, &c, 14).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn atr_warmup_boundary() {
        let (h, l, c) = bars(&[(105.0, 95.0, 100.0); 20]);
        let out = atr(&h, &l, &c, 14);
        assert!(out[13].is_nan());
        assert!(out[14].is_finite());
    }

    #[test]
    fn atr_constant_range_converges() {
        // Identical 10-point ranges with close at midpoint: every TR is 10.
        let specs: Vec<(f64, f64, f64)> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                (base + 5.0, base - 5.0, base)
            })
            .collect();
        let (h, l, c) = bars(&specs);
        let out = atr(&h, &l, &c, 14);
        let last = *out.last().unwrap();
        assert!((last - 10.0).abs() < 1.0, "expected ATR near 10, got {last}");
    }

    #[test]
    fn atr_gap_feeds_true_range() {
        // Overnight-style gap: |H - prevClose| dominates H - L.
        let specs = vec![
            (105.0, 95.0, 95.0),
            (115.0, 108.0, 112.0), // gap up: TR = |115 - 95| = 20
            (118.0, 110.0, 115.0),
            (120.0, 113.0, 118.0),
        ];
        let (h, l, c) = bars(&specs);
        let out = atr(&h, &l, &c, 3);
        assert!(out[3] > 7.0, "ATR should reflect the gap, got {}", out[3]);
    }

    #[test]
    fn atr_is_positive() {
        let specs: Vec<(f64, f64, f64)> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.5).sin() * 10.0;
                (base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        let (h, l, c) = bars(&specs);
        let out = atr(&h, &l, &c, 14);
        for &v in out.iter().filter(|v| v.is_finite()) {
            assert!(v > 0.0, "ATR must be positive, got {v}");
        }
    }
}
