// =============================================================================
// Money Flow Index (MFI)
// =============================================================================
//
// Raw money flow = typical price * volume, classified positive or negative by
// the direction of the typical price against the previous bar. Over a window
// of `period` flows:
//
//   MFI = 100 - 100 / (1 + Σpositive / Σnegative)
//
// A window with zero negative flow emits 100. Flat typical prices contribute
// to neither side.
// =============================================================================

/// Compute the MFI series over `period` bars.
///
/// The first flow needs a previous bar, so the output is defined from
/// index `period`.
pub fn mfi(highs: &[f64], lows: &[f64], closes: &[f64], volumes: &[u64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 || highs.len() != n || lows.len() != n || volumes.len() != n {
        return out;
    }

    let typical: Vec<f64> = (0..n)
        .map(|i| (highs[i] + lows[i] + closes[i]) / 3.0)
        .collect();

    // Signed flow per bar (index 0 has no direction).
    let mut pos_flow = vec![0.0; n];
    let mut neg_flow = vec![0.0; n];
    for i in 1..n {
        let raw = typical[i] * volumes[i] as f64;
        if typical[i] > typical[i - 1] {
            pos_flow[i] = raw;
        } else if typical[i] < typical[i - 1] {
            neg_flow[i] = raw;
        }
    }

    for i in period..n {
        let window = (i + 1 - period)..=i;
        let pos: f64 = pos_flow[window.clone()].iter().sum();
        let neg: f64 = neg_flow[window].iter().sum();

        out[i] = if neg == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + pos / neg)
        };
    }

    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn from_closes(closes: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<u64>) {
        let highs = closes.iter().map(|c| c + 1.0).collect();
        let lows = closes.iter().map(|c| c - 1.0).collect();
        let volumes = vec![100u64; closes.len()];
        (highs, lows, volumes)
    }

    #[test]
    fn mfi_warmup_boundary() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64 + 100.0).collect();
        let (h, l, v) = from_closes(&closes);
        let out = mfi(&h, &l, &closes, &v, 14);
        assert!(out[13].is_nan());
        assert!(out[14].is_finite());
    }

    #[test]
    fn mfi_all_up_is_100() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64 + 100.0).collect();
        let (h, l, v) = from_closes(&closes);
        let out = mfi(&h, &l, &closes, &v, 14);
        for &x in out.iter().filter(|x| x.is_finite()) {
            assert!((x - 100.0).abs() < 1e-10);
        }
    }

    #[test]
    fn mfi_all_down_is_0() {
        let closes: Vec<f64> = (1..=20).rev().map(|x| x as f64 + 100.0).collect();
        let (h, l, v) = from_closes(&closes);
        let out = mfi(&h, &l, &closes, &v, 14);
        for &x in out.iter().filter(|x| x.is_finite()) {
            assert!(x.abs() < 1e-10);
        }
    }

    #[test]
    fn mfi_flat_is_100() {
        // No direction at all: zero negative flow triggers the 100 rule.
        let closes = vec![100.0; 20];
        let (h, l, v) = from_closes(&closes);
        let out = mfi(&h, &l, &closes, &v, 14);
        for &x in out.iter().filter(|x| x.is_finite()) {
            assert!((x - 100.0).abs() < 1e-10);
        }
    }

    #[test]
    fn mfi_in_range() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let (h, l, v) = from_closes(&closes);
        let out = mfi(&h, &l, &closes, &v, 14);
        for &x in out.iter().filter(|x| x.is_finite()) {
            assert!((0.0..=100.0).contains(&x));
        }
    }

    #[test]
    fn mfi_volume_weighting_matters() {
        // One huge down bar outweighs many small up bars.
        let closes = vec![100.0, 101.0, 102.0, 103.0, 99.0, 100.5, 101.5, 102.5];
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        let mut volumes = vec![10u64; closes.len()];
        volumes[4] = 10_000; // the down move

        let out = mfi(&highs, &lows, &closes, &volumes, 5);
        let last = *out.last().unwrap();
        assert!(last < 50.0, "heavy down-volume should depress MFI, got {last}");
    }
}
