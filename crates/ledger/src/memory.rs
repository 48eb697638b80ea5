//! In-memory [`LedgerStore`] for paper accounts and tests.
//!
//! One mutex guards the whole book, taken only for synchronous sections, so
//! every store call is atomic by construction. The Postgres store mirrors the
//! same predicates with transactions.

use perp_core::{
    Account, CloseApplied, CloseApply, Direction, EngineError, LedgerStore, LimitFill, OpenInsert,
    Order, OrderKind, OrderStatus, PendingOrderInsert, Position, PositionStatus, Result, Trade,
    TradeAction,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<i64, Account>,
    positions: HashMap<i64, Position>,
    orders: HashMap<i64, Order>,
    trades: Vec<Trade>,
    next_account_id: i64,
    next_position_id: i64,
    next_order_id: i64,
    next_trade_id: i64,
}

impl Inner {
    fn account_mut(&mut self, id: i64) -> Result<&mut Account> {
        self.accounts
            .get_mut(&id)
            .ok_or(EngineError::AccountNotFound { id })
    }

    fn push_trade(&mut self, mut trade: Trade) {
        self.next_trade_id += 1;
        trade.id = self.next_trade_id;
        self.trades.push(trade);
    }
}

/// In-memory book behind a single mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn create_account(&self, starting_balance: Decimal) -> Result<Account> {
        let mut inner = self.inner.lock();
        inner.next_account_id += 1;
        let now = Utc::now();
        let account = Account {
            id: inner.next_account_id,
            balance: starting_balance,
            frozen: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            created_at: now,
            updated_at: now,
        };
        inner.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn account(&self, id: i64) -> Result<Option<Account>> {
        Ok(self.inner.lock().accounts.get(&id).cloned())
    }

    async fn position(&self, id: i64) -> Result<Option<Position>> {
        Ok(self.inner.lock().positions.get(&id).cloned())
    }

    async fn open_positions(&self, account_id: i64) -> Result<Vec<Position>> {
        let inner = self.inner.lock();
        let mut positions: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| p.account_id == account_id && p.is_open())
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.id);
        Ok(positions)
    }

    async fn open_virtual_positions(
        &self,
        account_id: i64,
        direction: Direction,
    ) -> Result<Vec<Position>> {
        let inner = self.inner.lock();
        let mut positions: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| {
                p.account_id == account_id
                    && p.is_virtual
                    && p.direction == direction
                    && p.is_open()
            })
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.id);
        Ok(positions)
    }

    async fn order(&self, id: i64) -> Result<Option<Order>> {
        Ok(self.inner.lock().orders.get(&id).cloned())
    }

    async fn pending_limit_orders(&self) -> Result<Vec<Order>> {
        let inner = self.inner.lock();
        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.kind == OrderKind::Limit)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }

    async fn recent_real_closes(
        &self,
        account_id: i64,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Trade>> {
        let inner = self.inner.lock();
        let mut closes: Vec<Trade> = inner
            .trades
            .iter()
            .filter(|t| {
                t.account_id == account_id
                    && t.direction == direction
                    && t.action == TradeAction::Close
                    && !t.is_virtual
            })
            .cloned()
            .collect();
        closes.sort_by(|a, b| b.id.cmp(&a.id));
        closes.truncate(limit);
        Ok(closes)
    }

    async fn insert_open(&self, insert: OpenInsert) -> Result<Position> {
        let mut inner = self.inner.lock();
        let account = inner.account_mut(insert.account_id)?;
        if !insert.is_virtual {
            if account.balance < insert.reserve {
                return Err(EngineError::insufficient_balance(
                    insert.reserve,
                    account.balance,
                ));
            }
            account.balance -= insert.reserve;
            account.frozen += insert.reserve;
            account.updated_at = insert.opened_at;
        }

        inner.next_position_id += 1;
        let position = Position {
            id: inner.next_position_id,
            account_id: insert.account_id,
            symbol: insert.symbol.clone(),
            direction: insert.direction,
            quantity: insert.quantity,
            entry_price: insert.entry_price,
            leverage: insert.leverage,
            margin: insert.margin,
            reserved: insert.reserve,
            liquidation_price: insert.liquidation_price,
            stop_loss: insert.stop_loss,
            take_profit: insert.take_profit,
            status: PositionStatus::Open,
            is_virtual: insert.is_virtual,
            peak_profit_pct: 0.0,
            close_price: None,
            close_reason: None,
            realized_pnl: None,
            opened_at: insert.opened_at,
            closed_at: None,
        };
        inner.positions.insert(position.id, position.clone());

        inner.next_order_id += 1;
        let order = Order {
            id: inner.next_order_id,
            account_id: insert.account_id,
            position_id: Some(position.id),
            symbol: insert.symbol.clone(),
            direction: insert.direction,
            kind: insert.kind,
            status: OrderStatus::Filled,
            quantity: insert.quantity,
            limit_price: None,
            fill_price: Some(insert.entry_price),
            leverage: insert.leverage,
            reserved: Decimal::ZERO,
            stop_loss: insert.stop_loss,
            take_profit: insert.take_profit,
            is_virtual: insert.is_virtual,
            created_at: insert.opened_at,
            resolved_at: Some(insert.opened_at),
        };
        let order_id = order.id;
        inner.orders.insert(order.id, order);

        inner.push_trade(Trade {
            id: 0,
            account_id: insert.account_id,
            position_id: position.id,
            order_id: Some(order_id),
            symbol: insert.symbol,
            direction: insert.direction,
            action: TradeAction::Open,
            quantity: insert.quantity,
            price: insert.entry_price,
            fee: insert.open_fee,
            realized_pnl: None,
            is_virtual: insert.is_virtual,
            executed_at: insert.opened_at,
        });

        Ok(position)
    }

    async fn insert_pending_order(&self, insert: PendingOrderInsert) -> Result<Order> {
        let mut inner = self.inner.lock();
        let account = inner.account_mut(insert.account_id)?;
        if !insert.is_virtual {
            if account.balance < insert.reserve {
                return Err(EngineError::insufficient_balance(
                    insert.reserve,
                    account.balance,
                ));
            }
            account.balance -= insert.reserve;
            account.frozen += insert.reserve;
            account.updated_at = insert.created_at;
        }

        inner.next_order_id += 1;
        let order = Order {
            id: inner.next_order_id,
            account_id: insert.account_id,
            position_id: None,
            symbol: insert.symbol,
            direction: insert.direction,
            kind: OrderKind::Limit,
            status: OrderStatus::Pending,
            quantity: insert.quantity,
            limit_price: Some(insert.limit_price),
            fill_price: None,
            leverage: insert.leverage,
            reserved: insert.reserve,
            stop_loss: insert.stop_loss,
            take_profit: insert.take_profit,
            is_virtual: insert.is_virtual,
            created_at: insert.created_at,
            resolved_at: None,
        };
        inner.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn apply_close(&self, apply: CloseApply) -> Result<CloseApplied> {
        let mut inner = self.inner.lock();
        let Some(position) = inner.positions.get(&apply.position_id).cloned() else {
            return Ok(CloseApplied::NotFound);
        };
        if !position.is_open() {
            return Ok(CloseApplied::AlreadyClosed);
        }
        if position.quantity != apply.expected_quantity {
            return Err(EngineError::ConcurrencyConflict {
                id: apply.position_id,
            });
        }

        let mut updated = position.clone();
        if apply.full_close {
            updated.status = PositionStatus::Closed;
            updated.close_price = Some(apply.exit_price);
            updated.close_reason = Some(apply.reason);
            updated.realized_pnl = Some(apply.realized_pnl);
            updated.closed_at = Some(apply.closed_at);
            updated.quantity = Decimal::ZERO;
            updated.margin = Decimal::ZERO;
            updated.reserved = Decimal::ZERO;
        } else {
            updated.quantity -= apply.close_quantity;
            updated.margin -= apply.margin_release;
            updated.reserved -= apply.reserve_release;
        }
        inner.positions.insert(updated.id, updated.clone());

        if !position.is_virtual {
            let full_close = apply.full_close;
            let realized = apply.realized_pnl;
            let account = inner.account_mut(position.account_id)?;
            account.frozen -= apply.reserve_release;
            account.balance += apply.balance_credit;
            account.realized_pnl += realized;
            if full_close {
                account.total_trades += 1;
                // Breakeven bumps neither counter.
                if realized > Decimal::ZERO {
                    account.winning_trades += 1;
                } else if realized < Decimal::ZERO {
                    account.losing_trades += 1;
                }
            }
            account.updated_at = apply.closed_at;
        }

        inner.push_trade(Trade {
            id: 0,
            account_id: position.account_id,
            position_id: position.id,
            order_id: None,
            symbol: position.symbol.clone(),
            direction: position.direction,
            action: TradeAction::Close,
            quantity: apply.close_quantity,
            price: apply.exit_price,
            fee: apply.close_fee,
            realized_pnl: Some(apply.realized_pnl),
            is_virtual: position.is_virtual,
            executed_at: apply.closed_at,
        });

        if apply.full_close {
            Ok(CloseApplied::Closed(updated))
        } else {
            Ok(CloseApplied::Partial(updated))
        }
    }

    async fn resolve_order(&self, order_id: i64, status: OrderStatus) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(order) = inner.orders.get(&order_id).cloned() else {
            return Ok(false);
        };
        if order.status != OrderStatus::Pending {
            return Ok(false);
        }
        let now = Utc::now();
        if !order.is_virtual && order.reserved > Decimal::ZERO {
            let account = inner.account_mut(order.account_id)?;
            account.frozen -= order.reserved;
            account.balance += order.reserved;
            account.updated_at = now;
        }
        if let Some(order) = inner.orders.get_mut(&order_id) {
            order.status = status;
            order.resolved_at = Some(now);
        }
        Ok(true)
    }

    async fn fill_limit_order(&self, fill: LimitFill) -> Result<Option<Position>> {
        let mut inner = self.inner.lock();
        let Some(order) = inner.orders.get(&fill.order_id).cloned() else {
            return Ok(None);
        };
        if order.status != OrderStatus::Pending {
            return Ok(None);
        }

        inner.next_position_id += 1;
        let position = Position {
            id: inner.next_position_id,
            account_id: order.account_id,
            symbol: order.symbol.clone(),
            direction: order.direction,
            quantity: order.quantity,
            entry_price: fill.fill_price,
            leverage: order.leverage,
            margin: fill.margin,
            // The frozen reservation moves from the order onto the position.
            reserved: order.reserved,
            liquidation_price: fill.liquidation_price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            status: PositionStatus::Open,
            is_virtual: order.is_virtual,
            peak_profit_pct: 0.0,
            close_price: None,
            close_reason: None,
            realized_pnl: None,
            opened_at: fill.filled_at,
            closed_at: None,
        };
        inner.positions.insert(position.id, position.clone());

        if let Some(order) = inner.orders.get_mut(&fill.order_id) {
            order.status = OrderStatus::Filled;
            order.fill_price = Some(fill.fill_price);
            order.position_id = Some(position.id);
            order.resolved_at = Some(fill.filled_at);
        }

        inner.push_trade(Trade {
            id: 0,
            account_id: order.account_id,
            position_id: position.id,
            order_id: Some(fill.order_id),
            symbol: order.symbol,
            direction: order.direction,
            action: TradeAction::Open,
            quantity: order.quantity,
            price: fill.fill_price,
            fee: fill.open_fee,
            realized_pnl: None,
            is_virtual: order.is_virtual,
            executed_at: fill.filled_at,
        });

        Ok(Some(position))
    }

    async fn set_peak_profit(&self, position_id: i64, peak_pct: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(position) = inner.positions.get_mut(&position_id) {
            position.peak_profit_pct = peak_pct;
        }
        Ok(())
    }
}
