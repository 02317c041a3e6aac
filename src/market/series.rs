// =============================================================================
// Series store — append-only OHLCV buffer with named indicator sequences
// =============================================================================
//
// One Series per live instance or backtest. Six parallel sequences (timestamp,
// open, high, low, close, volume) grow strictly monotonically in time; the
// last bar may be mutated in place while its minute is still open. Indicator
// sequences are stored full-length and index-aligned with the bars, with
// `f64::NAN` occupying positions before the indicator's warmup completes.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

/// A single 1-minute OHLCV bar. `timestamp` is the minute-aligned UTC open
/// time of the bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: u64,
}

impl Bar {
    /// OHLC consistency: low <= min(open, close) <= max(open, close) <= high.
    pub fn is_valid(&self) -> bool {
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        self.low <= body_lo
            && body_hi <= self.high
            && self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
    }
}

// ---------------------------------------------------------------------------
// Price source selector
// ---------------------------------------------------------------------------

/// Which input sequence an indicator reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceSource {
    Close,
    Open,
    High,
    Low,
    /// (high + low) / 2
    Median,
    /// (high + low + close) / 3
    Typical,
    /// (high + low + 2*close) / 4
    Weighted,
    Volume,
    /// Read another stored indicator sequence by name.
    Indicator(String),
}

impl PriceSource {
    /// Parse a price-source selector. Anything that is not a built-in keyword
    /// is treated as an indicator name.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "close" => Self::Close,
            "open" => Self::Open,
            "high" => Self::High,
            "low" => Self::Low,
            "median" => Self::Median,
            "typical" => Self::Typical,
            "weighted" => Self::Weighted,
            "volume" => Self::Volume,
            _ => Self::Indicator(s.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Series
// ---------------------------------------------------------------------------

/// Append-only OHLCV series for one contract, plus named indicator sequences.
#[derive(Debug, Clone, Default)]
pub struct Series {
    contract_id: String,
    timestamps: Vec<DateTime<Utc>>,
    opens: Vec<f64>,
    highs: Vec<f64>,
    lows: Vec<f64>,
    closes: Vec<f64>,
    volumes: Vec<u64>,
    indicators: HashMap<String, Vec<f64>>,
}

impl Series {
    pub fn new(contract_id: impl Into<String>) -> Self {
        Self {
            contract_id: contract_id.into(),
            ..Default::default()
        }
    }

    pub fn contract_id(&self) -> &str {
        &self.contract_id
    }

    /// Number of bars in the series.
    pub fn count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    // -------------------------------------------------------------------------
    // Growth
    // -------------------------------------------------------------------------

    /// Append a sealed bar. The timestamp must be strictly greater than the
    /// last bar's timestamp and the OHLC relation must hold.
    pub fn append(&mut self, bar: Bar) -> EngineResult<()> {
        if !bar.is_valid() {
            return Err(EngineError::Validation(format!(
                "bar at {} violates OHLC ordering (o={} h={} l={} c={})",
                bar.timestamp, bar.open, bar.high, bar.low, bar.close
            )));
        }
        if let Some(&last) = self.timestamps.last() {
            if bar.timestamp <= last {
                return Err(EngineError::Validation(format!(
                    "bar timestamp {} not after last bar {}",
                    bar.timestamp, last
                )));
            }
        }

        self.timestamps.push(bar.timestamp);
        self.opens.push(bar.open);
        self.highs.push(bar.high);
        self.lows.push(bar.low);
        self.closes.push(bar.close);
        self.volumes.push(bar.volume);
        Ok(())
    }

    /// Fold a trade into the current (last) bar: high = max, low = min,
    /// close = last price, volume accumulates.
    pub fn update_last(&mut self, price: f64, size: u64) -> EngineResult<()> {
        let n = self.count();
        if n == 0 {
            return Err(EngineError::Internal(
                "update_last called on empty series".into(),
            ));
        }
        let i = n - 1;
        if price > self.highs[i] {
            self.highs[i] = price;
        }
        if price < self.lows[i] {
            self.lows[i] = price;
        }
        self.closes[i] = price;
        self.volumes[i] += size;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bar access
    // -------------------------------------------------------------------------

    pub fn get_bar(&self, i: usize) -> Option<Bar> {
        if i >= self.count() {
            return None;
        }
        Some(Bar {
            timestamp: self.timestamps[i],
            open: self.opens[i],
            high: self.highs[i],
            low: self.lows[i],
            close: self.closes[i],
            volume: self.volumes[i],
        })
    }

    pub fn get_last(&self) -> Option<Bar> {
        self.count().checked_sub(1).and_then(|i| self.get_bar(i))
    }

    /// Bars in `[lo, hi)`, clamped to the series bounds.
    pub fn slice(&self, lo: usize, hi: usize) -> Vec<Bar> {
        let hi = hi.min(self.count());
        if lo >= hi {
            return Vec::new();
        }
        (lo..hi).filter_map(|i| self.get_bar(i)).collect()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn opens(&self) -> &[f64] {
        &self.opens
    }

    pub fn highs(&self) -> &[f64] {
        &self.highs
    }

    pub fn lows(&self) -> &[f64] {
        &self.lows
    }

    pub fn closes(&self) -> &[f64] {
        &self.closes
    }

    pub fn volumes(&self) -> &[u64] {
        &self.volumes
    }

    // -------------------------------------------------------------------------
    // Price data
    // -------------------------------------------------------------------------

    /// Materialise the input sequence for `source`, one value per bar.
    ///
    /// For `PriceSource::Indicator` the named sequence must already be stored;
    /// an unknown name yields an error so misconfigured algorithms fail at
    /// compute time rather than silently producing NaN.
    pub fn price_data(&self, source: &PriceSource) -> EngineResult<Vec<f64>> {
        let n = self.count();
        let data = match source {
            PriceSource::Close => self.closes.clone(),
            PriceSource::Open => self.opens.clone(),
            PriceSource::High => self.highs.clone(),
            PriceSource::Low => self.lows.clone(),
            PriceSource::Median => (0..n)
                .map(|i| (self.highs[i] + self.lows[i]) / 2.0)
                .collect(),
            PriceSource::Typical => (0..n)
                .map(|i| (self.highs[i] + self.lows[i] + self.closes[i]) / 3.0)
                .collect(),
            PriceSource::Weighted => (0..n)
                .map(|i| (self.highs[i] + self.lows[i] + 2.0 * self.closes[i]) / 4.0)
                .collect(),
            PriceSource::Volume => self.volumes.iter().map(|&v| v as f64).collect(),
            PriceSource::Indicator(name) => self
                .indicators
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::Validation(format!(
                    "price source references unknown indicator '{name}'"
                )))?,
        };
        Ok(data)
    }

    // -------------------------------------------------------------------------
    // Indicator storage
    // -------------------------------------------------------------------------

    /// Store (or replace) an indicator sequence. The sequence must not be
    /// longer than the bar count; shorter sequences are front-padded with NaN
    /// so `seq[i]` always corresponds to bar `i`.
    pub fn set_indicator(&mut self, name: impl Into<String>, mut seq: Vec<f64>) -> EngineResult<()> {
        let n = self.count();
        if seq.len() > n {
            return Err(EngineError::Internal(format!(
                "indicator sequence longer than series ({} > {n})",
                seq.len()
            )));
        }
        if seq.len() < n {
            let mut padded = vec![f64::NAN; n - seq.len()];
            padded.append(&mut seq);
            seq = padded;
        }
        self.indicators.insert(name.into(), seq);
        Ok(())
    }

    pub fn get_indicator(&self, name: &str) -> Option<&[f64]> {
        self.indicators.get(name).map(Vec::as_slice)
    }

    /// Value of indicator `name` at bar `i`. `None` when the indicator does
    /// not exist, the index is out of range, or the value is still in warmup
    /// (non-finite).
    pub fn indicator_value(&self, name: &str, i: usize) -> Option<f64> {
        let v = *self.indicators.get(name)?.get(i)?;
        v.is_finite().then_some(v)
    }

    pub fn has_indicator(&self, name: &str) -> bool {
        self.indicators.contains_key(name)
    }

    pub fn indicator_names(&self) -> Vec<String> {
        self.indicators.keys().cloned().collect()
    }

    /// Drop all stored indicator sequences (bars are kept).
    pub fn clear_indicators(&mut self) {
        self.indicators.clear();
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    /// Check every structural invariant: equal sequence lengths, strictly
    /// increasing timestamps, OHLC ordering per bar, indicator alignment.
    pub fn validate(&self) -> EngineResult<()> {
        let n = self.count();
        if self.opens.len() != n
            || self.highs.len() != n
            || self.lows.len() != n
            || self.closes.len() != n
            || self.volumes.len() != n
        {
            return Err(EngineError::Internal(
                "OHLCV sequences have unequal lengths".into(),
            ));
        }

        for i in 0..n {
            let bar = self.get_bar(i).ok_or_else(|| {
                EngineError::Internal(format!("bar {i} unavailable during validate"))
            })?;
            if !bar.is_valid() {
                return Err(EngineError::Internal(format!(
                    "bar {i} at {} violates OHLC ordering",
                    bar.timestamp
                )));
            }
            if i > 0 && self.timestamps[i] <= self.timestamps[i - 1] {
                return Err(EngineError::Internal(format!(
                    "timestamps not strictly increasing at index {i}"
                )));
            }
        }

        for (name, seq) in &self.indicators {
            if seq.len() > n {
                return Err(EngineError::Internal(format!(
                    "indicator '{name}' longer than series"
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 / 60 * 60 + min * 60, 0).unwrap()
    }

    fn bar(min: i64, close: f64) -> Bar {
        Bar {
            timestamp: ts(min),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10,
        }
    }

    fn series_with(n: i64) -> Series {
        let mut s = Series::new("CON.F.US.ENQ.U25");
        for i in 0..n {
            s.append(bar(i, 100.0 + i as f64)).unwrap();
        }
        s
    }

    #[test]
    fn append_and_count() {
        let s = series_with(5);
        assert_eq!(s.count(), 5);
        assert_eq!(s.get_bar(0).unwrap().close, 100.0);
        assert_eq!(s.get_last().unwrap().close, 104.0);
    }

    #[test]
    fn append_rejects_non_monotonic_timestamp() {
        let mut s = series_with(2);
        let err = s.append(bar(1, 50.0)).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        let err = s.append(bar(0, 50.0)).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn append_rejects_invalid_ohlc() {
        let mut s = Series::new("X");
        let bad = Bar {
            timestamp: ts(0),
            open: 100.0,
            high: 99.0, // high below open
            low: 98.0,
            close: 100.0,
            volume: 1,
        };
        assert!(s.append(bad).is_err());
    }

    #[test]
    fn update_last_folds_trade() {
        let mut s = series_with(1);
        s.update_last(105.0, 3).unwrap();
        let last = s.get_last().unwrap();
        assert_eq!(last.high, 105.0);
        assert_eq!(last.close, 105.0);
        assert_eq!(last.volume, 13);

        s.update_last(95.0, 2).unwrap();
        let last = s.get_last().unwrap();
        assert_eq!(last.low, 95.0);
        assert_eq!(last.close, 95.0);
        assert_eq!(last.volume, 15);
    }

    #[test]
    fn update_last_on_empty_is_internal_error() {
        let mut s = Series::new("X");
        assert_eq!(s.update_last(1.0, 1).unwrap_err().code(), "INTERNAL");
    }

    #[test]
    fn slice_clamps_bounds() {
        let s = series_with(5);
        assert_eq!(s.slice(1, 3).len(), 2);
        assert_eq!(s.slice(3, 100).len(), 2);
        assert!(s.slice(4, 2).is_empty());
    }

    #[test]
    fn price_data_sources() {
        let s = series_with(3);
        let close = s.price_data(&PriceSource::Close).unwrap();
        assert_eq!(close, vec![100.0, 101.0, 102.0]);

        let median = s.price_data(&PriceSource::Median).unwrap();
        // (h + l) / 2 == close for the synthetic bars.
        assert_eq!(median, close);

        let typical = s.price_data(&PriceSource::Typical).unwrap();
        assert!((typical[0] - 100.0).abs() < 1e-9);

        let weighted = s.price_data(&PriceSource::Weighted).unwrap();
        assert!((weighted[2] - 102.0).abs() < 1e-9);

        let volume = s.price_data(&PriceSource::Volume).unwrap();
        assert_eq!(volume, vec![10.0, 10.0, 10.0]);
    }

    #[test]
    fn price_data_unknown_indicator_fails() {
        let s = series_with(3);
        let err = s
            .price_data(&PriceSource::Indicator("Nope".into()))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn indicator_padding_and_alignment() {
        let mut s = series_with(5);
        // A 3-long sequence is front-padded to length 5.
        s.set_indicator("SMA_3", vec![1.0, 2.0, 3.0]).unwrap();
        let seq = s.get_indicator("SMA_3").unwrap();
        assert_eq!(seq.len(), 5);
        assert!(seq[0].is_nan());
        assert!(seq[1].is_nan());
        assert_eq!(seq[2], 1.0);

        assert_eq!(s.indicator_value("SMA_3", 4), Some(3.0));
        assert_eq!(s.indicator_value("SMA_3", 0), None); // warmup
        assert_eq!(s.indicator_value("SMA_3", 9), None); // out of range
        assert_eq!(s.indicator_value("missing", 0), None);
        assert!(s.has_indicator("SMA_3"));
        assert!(!s.has_indicator("missing"));
    }

    #[test]
    fn indicator_longer_than_series_rejected() {
        let mut s = series_with(2);
        let err = s.set_indicator("X", vec![1.0; 5]).unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
    }

    #[test]
    fn indicator_source_feeds_price_data() {
        let mut s = series_with(3);
        s.set_indicator("Fast", vec![5.0, 6.0, 7.0]).unwrap();
        let data = s
            .price_data(&PriceSource::Indicator("Fast".into()))
            .unwrap();
        assert_eq!(data, vec![5.0, 6.0, 7.0]);
    }

    #[test]
    fn validate_clean_series() {
        let s = series_with(10);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn price_source_parsing() {
        assert_eq!(PriceSource::parse("close"), PriceSource::Close);
        assert_eq!(PriceSource::parse("Median"), PriceSource::Median);
        assert_eq!(PriceSource::parse("VOLUME"), PriceSource::Volume);
        assert_eq!(
            PriceSource::parse("RSI_14"),
            PriceSource::Indicator("RSI_14".into())
        );
    }
}
