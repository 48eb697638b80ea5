//! Domain types shared across the engine.
//!
//! Money fields use `Decimal` end to end. Indicator math runs on `f64`, so
//! candles expose lossy `*_f64` accessors for that path only.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of a perpetual position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// Directional P&L before fees for a move from `entry` to `exit`.
    #[must_use]
    pub fn pnl(self, entry: Decimal, exit: Decimal, quantity: Decimal) -> Decimal {
        match self {
            Self::Long => (exit - entry) * quantity,
            Self::Short => (entry - exit) * quantity,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a position row. A position exists only once exposure
/// is held; a resting limit order reserves funds as a pending `Order` with
/// no position row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// Lifecycle state of an order row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
}

impl OrderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
        }
    }
}

/// Whether a trade row opened or closed exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Open,
    Close,
}

impl TradeAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    ExtremeLoss,
    SmartLoss,
    TrailingStop,
    RegimeReversal,
    StagedTimeout,
    MaxHold,
    SentinelCleanup,
    Manual,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::ExtremeLoss => "extreme_loss",
            Self::SmartLoss => "smart_loss",
            Self::TrailingStop => "trailing_stop",
            Self::RegimeReversal => "regime_reversal",
            Self::StagedTimeout => "staged_timeout",
            Self::MaxHold => "max_hold",
            Self::SentinelCleanup => "sentinel_cleanup",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle timeframes the classifier and monitors consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
}

impl Timeframe {
    #[must_use]
    pub fn minutes(self) -> u32 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::H1 => 60,
            Self::H4 => 240,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trend regime emitted by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    StrongUp,
    WeakUp,
    Ranging,
    WeakDown,
    StrongDown,
}

impl Regime {
    #[must_use]
    pub fn is_up(self) -> bool {
        matches!(self, Self::StrongUp | Self::WeakUp)
    }

    #[must_use]
    pub fn is_down(self) -> bool {
        matches!(self, Self::StrongDown | Self::WeakDown)
    }

    #[must_use]
    pub fn is_ranging(self) -> bool {
        matches!(self, Self::Ranging)
    }

    /// +1 for up regimes, -1 for down, 0 for ranging.
    #[must_use]
    pub fn sign(self) -> i8 {
        if self.is_up() {
            1
        } else if self.is_down() {
            -1
        } else {
            0
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrongUp => "strong_up",
            Self::WeakUp => "weak_up",
            Self::Ranging => "ranging",
            Self::WeakDown => "weak_down",
            Self::StrongDown => "strong_down",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    #[must_use]
    pub fn open_f64(&self) -> f64 {
        self.open.try_into().unwrap_or(0.0)
    }

    #[must_use]
    pub fn high_f64(&self) -> f64 {
        self.high.try_into().unwrap_or(0.0)
    }

    #[must_use]
    pub fn low_f64(&self) -> f64 {
        self.low.try_into().unwrap_or(0.0)
    }

    #[must_use]
    pub fn close_f64(&self) -> f64 {
        self.close.try_into().unwrap_or(0.0)
    }
}

/// Paper account. `balance` is the free side; `frozen` holds reservations for
/// open positions and pending limit orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub balance: Decimal,
    pub frozen: Decimal,
    pub realized_pnl: Decimal,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Balance available for new reservations.
    #[must_use]
    pub fn available(&self) -> Decimal {
        self.balance
    }

    /// Balance plus frozen reservations.
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.balance + self.frozen
    }
}

/// An isolated-margin perpetual position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub margin: Decimal,
    /// Frozen amount backing this position: margin plus the open fee.
    /// Zero for virtual positions.
    pub reserved: Decimal,
    pub liquidation_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: PositionStatus,
    /// Sentinel probe positions move no money.
    pub is_virtual: bool,
    /// Best profit percentage seen so far, for trailing exits.
    pub peak_profit_pct: f64,
    pub close_price: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
    pub realized_pnl: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Directional P&L before fees at `price`.
    #[must_use]
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.direction.pnl(self.entry_price, price, self.quantity)
    }

    /// Price move from entry as a signed percentage, positive when the
    /// position is in profit. Unleveraged.
    #[must_use]
    pub fn profit_pct(&self, price: Decimal) -> f64 {
        if self.entry_price.is_zero() {
            return 0.0;
        }
        let entry: f64 = self.entry_price.try_into().unwrap_or(0.0);
        let price: f64 = price.try_into().unwrap_or(0.0);
        if entry == 0.0 {
            return 0.0;
        }
        let raw = (price - entry) / entry * 100.0;
        match self.direction {
            Direction::Long => raw,
            Direction::Short => -raw,
        }
    }
}

/// An order row. Market opens are inserted already filled; limit orders sit
/// pending until the executor fills, cancels, or expires them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub account_id: i64,
    pub position_id: Option<i64>,
    pub symbol: String,
    pub direction: Direction,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub fill_price: Option<Decimal>,
    pub leverage: u32,
    /// Frozen amount backing this order while pending. Zero for virtual.
    pub reserved: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub is_virtual: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// An executed fill, open or close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub account_id: i64,
    pub position_id: i64,
    pub order_id: Option<i64>,
    pub symbol: String,
    pub direction: Direction,
    pub action: TradeAction,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    /// Net of fees; only set on close trades.
    pub realized_pnl: Option<Decimal>,
    pub is_virtual: bool,
    pub executed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(direction: Direction, entry: Decimal) -> Position {
        Position {
            id: 1,
            account_id: 1,
            symbol: "BTCUSDT".into(),
            direction,
            quantity: dec!(0.5),
            entry_price: entry,
            leverage: 10,
            margin: dec!(2500),
            reserved: dec!(2512.5),
            liquidation_price: dec!(0),
            stop_loss: None,
            take_profit: None,
            status: PositionStatus::Open,
            is_virtual: false,
            peak_profit_pct: 0.0,
            close_price: None,
            close_reason: None,
            realized_pnl: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn pnl_is_directional() {
        assert_eq!(
            Direction::Long.pnl(dec!(100), dec!(110), dec!(2)),
            dec!(20)
        );
        assert_eq!(
            Direction::Short.pnl(dec!(100), dec!(110), dec!(2)),
            dec!(-20)
        );
        assert_eq!(
            Direction::Short.pnl(dec!(100), dec!(90), dec!(2)),
            dec!(20)
        );
    }

    #[test]
    fn profit_pct_is_directional() {
        let long = position(Direction::Long, dec!(50000));
        assert!((long.profit_pct(dec!(51000)) - 2.0).abs() < 1e-9);
        assert!((long.profit_pct(dec!(49000)) + 2.0).abs() < 1e-9);

        let short = position(Direction::Short, dec!(50000));
        assert!((short.profit_pct(dec!(49000)) - 2.0).abs() < 1e-9);
        assert!((short.profit_pct(dec!(51000)) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn account_available_excludes_frozen() {
        let account = Account {
            id: 1,
            balance: dec!(7000),
            frozen: dec!(3000),
            realized_pnl: dec!(0),
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(account.available(), dec!(7000));
        assert_eq!(account.total(), dec!(10000));
    }

    #[test]
    fn timeframe_minutes() {
        assert_eq!(Timeframe::M1.minutes(), 1);
        assert_eq!(Timeframe::M5.minutes(), 5);
        assert_eq!(Timeframe::H4.minutes(), 240);
    }

    #[test]
    fn regime_sign() {
        assert_eq!(Regime::StrongUp.sign(), 1);
        assert_eq!(Regime::WeakDown.sign(), -1);
        assert_eq!(Regime::Ranging.sign(), 0);
        assert!(Regime::WeakUp.is_up());
        assert!(!Regime::Ranging.is_down());
    }

    #[test]
    fn status_strings() {
        assert_eq!(PositionStatus::Open.as_str(), "open");
        assert_eq!(OrderStatus::Expired.as_str(), "expired");
        assert_eq!(CloseReason::TrailingStop.as_str(), "trailing_stop");
    }
}
