// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average.
//
// Formula:
//   k       = 2 / (period + 1)
//   EMA_t   = value_t * k + EMA_{t-1} * (1 - k)
//
// The first EMA value, at index `period - 1`, is seeded with the SMA of the
// first `period` samples.
// =============================================================================

/// Compute the EMA series for `values` with look-back `period`.
///
/// The output has the same length as `values`; positions before index
/// `period - 1` are `NaN`. A `period` of zero or longer than the input
/// yields an all-NaN series.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || period > n {
        return out;
    }

    let k = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;

    let mut prev = seed;
    for i in period..n {
        let e = values[i] * k + prev * (1.0 - k);
        out[i] = e;
        prev = e;
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
    fn ema_empty_input() {
        assert!(ema(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero_all_nan() {
        let out = ema(&[1.0, 2.0, 3.0], 0);
        assert!(out.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn ema_insufficient_data_all_nan() {
        let out = ema(&[1.0, 2.0], 5);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn ema_seed_is_sma() {
        let values = vec![2.0, 4.0, 6.0];
        let out = ema(&values, 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert!((out[2] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_recurrence_law() {
        // |EMA[i] - (x[i]*k + EMA[i-1]*(1-k))| < 1e-9 for all i past warmup.
        let values: Vec<f64> = (1..=50).map(|x| (x as f64).sin() * 10.0 + 100.0).collect();
        let period = 5;
        let out = ema(&values, period);
        let k = 2.0 / (period + 1) as f64;

        for i in period..values.len() {
            let expected = values[i] * k + out[i - 1] * (1.0 - k);
            assert!(
                (out[i] - expected).abs() < 1e-9,
                "EMA law violated at {i}: {} vs {expected}",
                out[i]
            );
        }
    }

    #[test]
    fn ema_known_sequence() {
        // 5-period EMA of [1..10]: seed 3.0, k = 1/3.
        let values: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let out = ema(&values, 5);

        let k = 2.0 / 6.0;
        let mut expected = 3.0;
        assert!((out[4] - expected).abs() < 1e-10);
        for i in 5..10 {
            expected = values[i] * k + expected * (1.0 - k);
            assert!((out[i] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn ema_converges_on_flat_series() {
        let values = vec![100.0; 40];
        let out = ema(&values, 10);
        assert!((out[39] - 100.0).abs() < 1e-10);
    }
}
