// =============================================================================
// Position state machine and closed-trade accounting
// =============================================================================
//
// A position is flat (NONE, quantity 0, entry price 0) or open on one side.
// P&L is computed in account currency through the contract's tick geometry:
//
//   pnl = point_diff * (tick_value / tick_size) * quantity - commission
//
// where point_diff is exit - entry for LONG and entry - exit for SHORT.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Side, TickSpec};

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Current position of an instance. Flat iff `side == Side::None`, which also
/// forces `quantity == 0` and `entry_price == 0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub side: Side,
    pub quantity: u32,
    pub entry_price: f64,
    #[serde(default)]
    pub entry_time: Option<DateTime<Utc>>,
}

impl Default for Position {
    fn default() -> Self {
        Self::flat()
    }
}

impl Position {
    pub fn flat() -> Self {
        Self {
            side: Side::None,
            quantity: 0,
            entry_price: 0.0,
            entry_time: None,
        }
    }

    pub fn open(side: Side, quantity: u32, entry_price: f64, entry_time: DateTime<Utc>) -> Self {
        debug_assert!(side != Side::None && quantity > 0);
        Self {
            side,
            quantity,
            entry_price,
            entry_time: Some(entry_time),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == Side::None
    }

    /// The flat/quantity/entry-price invariant.
    pub fn is_consistent(&self) -> bool {
        match self.side {
            Side::None => self.quantity == 0 && self.entry_price == 0.0,
            _ => self.quantity > 0 && self.entry_price != 0.0,
        }
    }

    /// Signed point difference in the position's favour at `price`.
    pub fn point_diff(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => price - self.entry_price,
            Side::Short => self.entry_price - price,
            Side::None => 0.0,
        }
    }

    /// Unrealized P&L in account currency at `price` (no commission).
    pub fn unrealized_pnl(&self, price: f64, tick: TickSpec) -> f64 {
        if self.is_flat() {
            return 0.0;
        }
        self.point_diff(price) * tick.point_value() * self.quantity as f64
    }

    /// Close the position into a trade record and reset to flat.
    pub fn close(
        &mut self,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        commission: f64,
        tick: TickSpec,
        entry_signal: String,
        exit_signal: String,
    ) -> Option<ClosedTrade> {
        if self.is_flat() {
            return None;
        }

        let entry_time = self.entry_time.unwrap_or(exit_time);
        let gross = self.point_diff(exit_price) * tick.point_value() * self.quantity as f64;
        let pnl = gross - commission;
        let pnl_percent = if self.entry_price != 0.0 {
            self.point_diff(exit_price) / self.entry_price * 100.0
        } else {
            0.0
        };

        let trade = ClosedTrade {
            id: Uuid::new_v4().to_string(),
            entry_time,
            exit_time,
            side: self.side,
            entry_price: self.entry_price,
            exit_price,
            quantity: self.quantity,
            pnl,
            pnl_percent,
            commission,
            entry_signal,
            exit_signal,
            duration_secs: (exit_time - entry_time).num_seconds().max(0),
        };

        *self = Self::flat();
        Some(trade)
    }
}

// ---------------------------------------------------------------------------
// Closed trade
// ---------------------------------------------------------------------------

/// A completed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedTrade {
    pub id: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: u32,
    /// Net of commission.
    pub pnl: f64,
    pub pnl_percent: f64,
    pub commission: f64,
    pub entry_signal: String,
    pub exit_signal: String,
    pub duration_secs: i64,
}

/// Running win/loss totals for an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeTotals {
    pub pnl: f64,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
}

impl TradeTotals {
    pub fn record(&mut self, trade: &ClosedTrade) {
        self.pnl += trade.pnl;
        self.trades += 1;
        if trade.pnl > 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tick_spec;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn flat_invariant() {
        let p = Position::flat();
        assert!(p.is_flat());
        assert!(p.is_consistent());
        assert_eq!(p.quantity, 0);
        assert_eq!(p.entry_price, 0.0);
        assert_eq!(p.unrealized_pnl(5000.0, tick_spec("ES")), 0.0);
    }

    #[test]
    fn open_long_unrealized_pnl_es() {
        // ES: tick 0.25 / $12.50, so one point is $50.
        let p = Position::open(Side::Long, 1, 4550.0, t0());
        assert!(p.is_consistent());
        let pnl = p.unrealized_pnl(4548.0, tick_spec("ES"));
        assert!((pnl + 100.0).abs() < 1e-9, "expected -100, got {pnl}");
    }

    #[test]
    fn short_mirrors_long() {
        let long = Position::open(Side::Long, 2, 100.0, t0());
        let short = Position::open(Side::Short, 2, 100.0, t0());
        let tick = tick_spec("NQ");
        assert!((long.unrealized_pnl(101.0, tick) + short.unrealized_pnl(101.0, tick)).abs() < 1e-9);
    }

    #[test]
    fn close_long_with_commission() {
        let mut p = Position::open(Side::Long, 1, 4550.0, t0());
        let trade = p
            .close(
                4548.0,
                t0() + chrono::Duration::minutes(3),
                2.5,
                tick_spec("ES"),
                "entry".into(),
                "stop".into(),
            )
            .unwrap();

        assert!((trade.pnl + 102.5).abs() < 1e-9);
        assert_eq!(trade.quantity, 1);
        assert_eq!(trade.side, Side::Long);
        assert_eq!(trade.duration_secs, 180);
        assert!(p.is_flat());
        assert!(p.is_consistent());
    }

    #[test]
    fn close_short_profit() {
        let mut p = Position::open(Side::Short, 3, 20_000.0, t0());
        let trade = p
            .close(
                19_990.0,
                t0() + chrono::Duration::minutes(1),
                0.0,
                tick_spec("MNQ"),
                "e".into(),
                "x".into(),
            )
            .unwrap();
        // 10 points * ($0.50 / 0.25) * 3 = 60.
        assert!((trade.pnl - 60.0).abs() < 1e-9);
        assert!(trade.pnl_percent > 0.0);
    }

    #[test]
    fn close_flat_is_none() {
        let mut p = Position::flat();
        assert!(p
            .close(100.0, t0(), 0.0, tick_spec("ES"), String::new(), String::new())
            .is_none());
    }

    #[test]
    fn totals_accumulate() {
        let mut totals = TradeTotals::default();
        let mut p = Position::open(Side::Long, 1, 100.0, t0());
        let win = p
            .close(110.0, t0(), 0.0, tick_spec("YM"), "e".into(), "x".into())
            .unwrap();
        totals.record(&win);

        let mut p = Position::open(Side::Long, 1, 100.0, t0());
        let loss = p
            .close(95.0, t0(), 0.0, tick_spec("YM"), "e".into(), "x".into())
            .unwrap();
        totals.record(&loss);

        assert_eq!(totals.trades, 2);
        assert_eq!(totals.wins, 1);
        assert_eq!(totals.losses, 1);
        assert!((totals.pnl - (win.pnl + loss.pnl)).abs() < 1e-9);
    }

    #[test]
    fn serde_round_trip() {
        let p = Position::open(Side::Short, 2, 1234.5, t0());
        let json = serde_json::to_string(&p).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
