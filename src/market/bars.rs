// =============================================================================
// Bar builder — folds a raw trade stream into 1-minute OHLCV bars
// =============================================================================
//
// The open (current-minute) bar lives in the Series as its last element and is
// mutated in place via `update_last` until the minute rolls over. Minutes with
// no trades produce no bars; ticks older than the open bar are dropped.
// =============================================================================

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tracing::warn;

use crate::broker::TradeTick;
use crate::errors::EngineResult;
use crate::market::series::{Bar, Series};

/// Outcome of feeding one trade into the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarUpdate {
    /// A new bar was opened (the previous bar, if any, is now sealed).
    pub is_new_bar: bool,
    /// The tick was older than the open bar and was discarded.
    pub dropped: bool,
}

/// Per-instance bar construction state.
#[derive(Debug, Default)]
pub struct BarBuilder {
    current_minute: Option<DateTime<Utc>>,
    dropped_ticks: u64,
}

impl BarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total out-of-order ticks discarded since construction.
    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks
    }

    /// Fold one trade into `series`.
    ///
    /// * First trade of a new minute: appends a fresh bar seeded with the
    ///   trade price (the previous open bar is thereby sealed).
    /// * Trade within the open minute: high/low/close/volume folded in place.
    /// * Trade older than the open minute: dropped with a log.
    pub fn apply(&mut self, series: &mut Series, trade: &TradeTick) -> EngineResult<BarUpdate> {
        let minute = floor_minute(trade.timestamp);

        match self.current_minute {
            Some(current) if minute < current => {
                self.dropped_ticks += 1;
                warn!(
                    contract = %series.contract_id(),
                    tick_ts = %trade.timestamp,
                    open_bar = %current,
                    "out-of-order tick dropped"
                );
                Ok(BarUpdate {
                    is_new_bar: false,
                    dropped: true,
                })
            }
            Some(current) if minute == current => {
                series.update_last(trade.price, trade.size)?;
                Ok(BarUpdate {
                    is_new_bar: false,
                    dropped: false,
                })
            }
            _ => {
                // No open bar yet, or the minute rolled forward.
                series.append(Bar {
                    timestamp: minute,
                    open: trade.price,
                    high: trade.price,
                    low: trade.price,
                    close: trade.price,
                    volume: trade.size,
                })?;
                self.current_minute = Some(minute);
                Ok(BarUpdate {
                    is_new_bar: true,
                    dropped: false,
                })
            }
        }
    }

    /// Re-arm the builder from a series that already contains bars (e.g.
    /// after a historical backfill) so the next live tick extends the series
    /// instead of colliding with the last loaded bar.
    pub fn resync(&mut self, series: &Series) {
        self.current_minute = series.get_last().map(|b| b.timestamp);
    }
}

/// Truncate a timestamp to its minute boundary.
fn floor_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    // duration_trunc cannot fail for a one-minute granule.
    ts.duration_trunc(TimeDelta::minutes(1)).unwrap_or(ts)
}
