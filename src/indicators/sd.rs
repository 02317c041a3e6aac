// =============================================================================
// Standard Deviation (SD)
// =============================================================================
//
// Population standard deviation over the last `period` samples, defined from
// index `period - 1`.
// =============================================================================

/// Compute the rolling population standard deviation of `values`.
pub fn sd(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || period > n {
        return out;
    }

    for i in (period - 1)..n {
        let window = &values[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window
            .iter()
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum::<f64>()
            / period as f64;
        out[i] = variance.sqrt();
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
    fn sd_flat_series_is_zero() {
        let out = sd(&[5.0; 10], 4);
        for &v in out.iter().filter(|v| v.is_finite()) {
            assert!(v.abs() < 1e-12);
        }
    }

    #[test]
    fn sd_known_value() {
        // Population SD of [2, 4, 4, 4, 5, 5, 7, 9] is exactly 2.
        let values = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let out = sd(&values, 8);
        assert!((out[7] - 2.0).abs() < 1e-10);
    }

    #[test]
    fn sd_warmup_prefix() {
        let out = sd(&[1.0, 2.0, 3.0, 4.0], 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert!(out[2].is_finite());
    }

    #[test]
    fn sd_period_longer_than_input_all_nan() {
        assert!(sd(&[1.0, 2.0], 5).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn sd_is_nonnegative() {
        let values: Vec<f64> = (0..30).map(|i| (i as f64 * 1.3).sin() * 20.0).collect();
        for &v in sd(&values, 7).iter().filter(|v| v.is_finite()) {
            assert!(v >= 0.0);
        }
    }
}
