//! Storage seam for the ledger.
//!
//! The ledger computes all money arithmetic up front and hands the store a
//! fully-specified atomic mutation. Implementations only have to apply the
//! mutation transactionally and enforce the two predicates that make
//! concurrent callers safe: the available-balance check on open, and the
//! `status = open` compare-and-set on close.

use crate::error::Result;
use crate::types::{
    Account, CloseReason, Direction, Order, OrderKind, OrderStatus, Position, Trade,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Atomic open: check available balance, move `reserve` from balance to
/// frozen, insert Position(open) + Order(filled) + Trade(open).
#[derive(Debug, Clone)]
pub struct OpenInsert {
    pub account_id: i64,
    pub symbol: String,
    pub direction: Direction,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub margin: Decimal,
    /// Margin + open fee moved from balance to frozen. Zero for virtual opens.
    pub reserve: Decimal,
    pub open_fee: Decimal,
    pub liquidation_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub is_virtual: bool,
    pub opened_at: DateTime<Utc>,
}

/// Atomic reservation for a not-yet-marketable limit order: check available
/// balance, freeze `reserve`, insert a pending order with no position.
#[derive(Debug, Clone)]
pub struct PendingOrderInsert {
    pub account_id: i64,
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub limit_price: Decimal,
    pub leverage: u32,
    pub reserve: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub is_virtual: bool,
    pub created_at: DateTime<Utc>,
}

/// Atomic close. Applied only when the stored status is still `open` and the
/// stored quantity matches `expected_quantity`; otherwise the outcome reports
/// what the store found, so racing closers no-op instead of erroring.
#[derive(Debug, Clone)]
pub struct CloseApply {
    pub position_id: i64,
    pub expected_quantity: Decimal,
    pub close_quantity: Decimal,
    pub exit_price: Decimal,
    /// Directional P&L before fees.
    pub pnl: Decimal,
    pub close_fee: Decimal,
    /// pnl - close fee; recorded on the close trade.
    pub realized_pnl: Decimal,
    /// Margin share returned to balance (zero for virtual).
    pub margin_release: Decimal,
    /// Frozen amount released (margin share + open-fee share; zero for virtual).
    pub reserve_release: Decimal,
    /// Net credit to balance: margin release + realized P&L (zero for virtual).
    pub balance_credit: Decimal,
    pub full_close: bool,
    pub reason: CloseReason,
    pub closed_at: DateTime<Utc>,
}

/// What the store found when applying a close.
#[derive(Debug, Clone)]
pub enum CloseApplied {
    /// Full close landed; the returned position is `closed`.
    Closed(Position),
    /// Partial close landed; the returned position is still `open` with
    /// reduced quantity/margin.
    Partial(Position),
    /// Another closer already won; nothing was mutated.
    AlreadyClosed,
    /// No position with this id exists.
    NotFound,
}

/// Atomic limit fill: flip a pending order to filled and create its position.
#[derive(Debug, Clone)]
pub struct LimitFill {
    pub order_id: i64,
    pub fill_price: Decimal,
    pub margin: Decimal,
    pub open_fee: Decimal,
    pub liquidation_price: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// The single source of truth for money-moving state.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates an account with a starting balance.
    async fn create_account(&self, starting_balance: Decimal) -> Result<Account>;

    async fn account(&self, id: i64) -> Result<Option<Account>>;

    async fn position(&self, id: i64) -> Result<Option<Position>>;

    /// Open positions for an account, real and virtual.
    async fn open_positions(&self, account_id: i64) -> Result<Vec<Position>>;

    /// Open sentinel positions for an account in one direction.
    async fn open_virtual_positions(
        &self,
        account_id: i64,
        direction: Direction,
    ) -> Result<Vec<Position>>;

    async fn order(&self, id: i64) -> Result<Option<Order>>;

    /// All pending limit orders across accounts, oldest first.
    async fn pending_limit_orders(&self) -> Result<Vec<Order>>;

    /// Closed real (non-virtual) trades in one direction, newest first.
    async fn recent_real_closes(
        &self,
        account_id: i64,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Trade>>;

    /// Applies an atomic open. Fails with `InsufficientBalance` when the
    /// available balance cannot cover the reserve.
    async fn insert_open(&self, insert: OpenInsert) -> Result<Position>;

    /// Freezes the reserve and inserts a pending limit order.
    async fn insert_pending_order(&self, insert: PendingOrderInsert) -> Result<Order>;

    /// Applies an atomic close under the `status = open` predicate.
    async fn apply_close(&self, apply: CloseApply) -> Result<CloseApplied>;

    /// Resolves a pending order (cancelled/expired), releasing its
    /// reservation. Returns false when the order was no longer pending.
    async fn resolve_order(&self, order_id: i64, status: OrderStatus) -> Result<bool>;

    /// Fills a pending limit order, creating its position. Returns `None`
    /// when the order was no longer pending.
    async fn fill_limit_order(&self, fill: LimitFill) -> Result<Option<Position>>;

    /// Persists the running peak-profit marker for an open position.
    async fn set_peak_profit(&self, position_id: i64, peak_pct: f64) -> Result<()>;
}
