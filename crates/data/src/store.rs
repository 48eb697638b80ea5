//! Postgres [`LedgerStore`].
//!
//! Mirrors the in-memory store's predicates with row locks: opens lock the
//! account row before the balance check, closes lock the position row and
//! re-check `status = 'open'` and the expected quantity inside the
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use perp_core::{
    Account, CloseApplied, CloseApply, CloseReason, Direction, EngineError, LedgerStore, LimitFill,
    OpenInsert, Order, OrderKind, OrderStatus, PendingOrderInsert, Position, PositionStatus,
    Result, Trade, TradeAction,
};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::database::DatabaseClient;

fn db_err(err: sqlx::Error) -> EngineError {
    EngineError::storage(err.to_string())
}

fn parse_direction(s: &str) -> Result<Direction> {
    match s {
        "long" => Ok(Direction::Long),
        "short" => Ok(Direction::Short),
        other => Err(EngineError::storage(format!("unknown direction: {other}"))),
    }
}

fn parse_position_status(s: &str) -> Result<PositionStatus> {
    match s {
        "open" => Ok(PositionStatus::Open),
        "closed" => Ok(PositionStatus::Closed),
        other => Err(EngineError::storage(format!("unknown position status: {other}"))),
    }
}

fn parse_order_status(s: &str) -> Result<OrderStatus> {
    match s {
        "pending" => Ok(OrderStatus::Pending),
        "filled" => Ok(OrderStatus::Filled),
        "cancelled" => Ok(OrderStatus::Cancelled),
        "expired" => Ok(OrderStatus::Expired),
        other => Err(EngineError::storage(format!("unknown order status: {other}"))),
    }
}

fn parse_order_kind(s: &str) -> Result<OrderKind> {
    match s {
        "market" => Ok(OrderKind::Market),
        "limit" => Ok(OrderKind::Limit),
        other => Err(EngineError::storage(format!("unknown order kind: {other}"))),
    }
}

fn parse_trade_action(s: &str) -> Result<TradeAction> {
    match s {
        "open" => Ok(TradeAction::Open),
        "close" => Ok(TradeAction::Close),
        other => Err(EngineError::storage(format!("unknown trade action: {other}"))),
    }
}

fn parse_close_reason(s: &str) -> Result<CloseReason> {
    match s {
        "stop_loss" => Ok(CloseReason::StopLoss),
        "take_profit" => Ok(CloseReason::TakeProfit),
        "extreme_loss" => Ok(CloseReason::ExtremeLoss),
        "smart_loss" => Ok(CloseReason::SmartLoss),
        "trailing_stop" => Ok(CloseReason::TrailingStop),
        "regime_reversal" => Ok(CloseReason::RegimeReversal),
        "staged_timeout" => Ok(CloseReason::StagedTimeout),
        "max_hold" => Ok(CloseReason::MaxHold),
        "sentinel_cleanup" => Ok(CloseReason::SentinelCleanup),
        "manual" => Ok(CloseReason::Manual),
        other => Err(EngineError::storage(format!("unknown close reason: {other}"))),
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    balance: Decimal,
    frozen: Decimal,
    realized_pnl: Decimal,
    total_trades: i64,
    winning_trades: i64,
    losing_trades: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AccountRow {
    fn into_account(self) -> Account {
        Account {
            id: self.id,
            balance: self.balance,
            frozen: self.frozen,
            realized_pnl: self.realized_pnl,
            total_trades: u64::try_from(self.total_trades).unwrap_or(0),
            winning_trades: u64::try_from(self.winning_trades).unwrap_or(0),
            losing_trades: u64::try_from(self.losing_trades).unwrap_or(0),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PositionRow {
    id: i64,
    account_id: i64,
    symbol: String,
    direction: String,
    quantity: Decimal,
    entry_price: Decimal,
    leverage: i32,
    margin: Decimal,
    reserved: Decimal,
    liquidation_price: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
    status: String,
    is_virtual: bool,
    peak_profit_pct: f64,
    close_price: Option<Decimal>,
    close_reason: Option<String>,
    realized_pnl: Option<Decimal>,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl PositionRow {
    fn into_position(self) -> Result<Position> {
        let close_reason = self
            .close_reason
            .as_deref()
            .map(parse_close_reason)
            .transpose()?;
        Ok(Position {
            id: self.id,
            account_id: self.account_id,
            symbol: self.symbol,
            direction: parse_direction(&self.direction)?,
            quantity: self.quantity,
            entry_price: self.entry_price,
            leverage: u32::try_from(self.leverage).unwrap_or(1),
            margin: self.margin,
            reserved: self.reserved,
            liquidation_price: self.liquidation_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            status: parse_position_status(&self.status)?,
            is_virtual: self.is_virtual,
            peak_profit_pct: self.peak_profit_pct,
            close_price: self.close_price,
            close_reason,
            realized_pnl: self.realized_pnl,
            opened_at: self.opened_at,
            closed_at: self.closed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: i64,
    account_id: i64,
    position_id: Option<i64>,
    symbol: String,
    direction: String,
    kind: String,
    status: String,
    quantity: Decimal,
    limit_price: Option<Decimal>,
    fill_price: Option<Decimal>,
    leverage: i32,
    reserved: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
    is_virtual: bool,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl OrderRow {
    fn into_order(self) -> Result<Order> {
        Ok(Order {
            id: self.id,
            account_id: self.account_id,
            position_id: self.position_id,
            symbol: self.symbol,
            direction: parse_direction(&self.direction)?,
            kind: parse_order_kind(&self.kind)?,
            status: parse_order_status(&self.status)?,
            quantity: self.quantity,
            limit_price: self.limit_price,
            fill_price: self.fill_price,
            leverage: u32::try_from(self.leverage).unwrap_or(1),
            reserved: self.reserved,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            is_virtual: self.is_virtual,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TradeRow {
    id: i64,
    account_id: i64,
    position_id: i64,
    order_id: Option<i64>,
    symbol: String,
    direction: String,
    action: String,
    quantity: Decimal,
    price: Decimal,
    fee: Decimal,
    realized_pnl: Option<Decimal>,
    is_virtual: bool,
    executed_at: DateTime<Utc>,
}

impl TradeRow {
    fn into_trade(self) -> Result<Trade> {
        Ok(Trade {
            id: self.id,
            account_id: self.account_id,
            position_id: self.position_id,
            order_id: self.order_id,
            symbol: self.symbol,
            direction: parse_direction(&self.direction)?,
            action: parse_trade_action(&self.action)?,
            quantity: self.quantity,
            price: self.price,
            fee: self.fee,
            realized_pnl: self.realized_pnl,
            is_virtual: self.is_virtual,
            executed_at: self.executed_at,
        })
    }
}

const POSITION_COLUMNS: &str = "id, account_id, symbol, direction, quantity, entry_price, \
     leverage, margin, reserved, liquidation_price, stop_loss, take_profit, status, is_virtual, \
     peak_profit_pct, close_price, close_reason, realized_pnl, opened_at, closed_at";

const ORDER_COLUMNS: &str = "id, account_id, position_id, symbol, direction, kind, status, \
     quantity, limit_price, fill_price, leverage, reserved, stop_loss, take_profit, is_virtual, \
     created_at, resolved_at";

/// Postgres-backed ledger store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(client: &DatabaseClient) -> Self {
        Self {
            pool: client.pool(),
        }
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn create_account(&self, starting_balance: Decimal) -> Result<Account> {
        let row = sqlx::query_as::<_, AccountRow>(
            r"
            INSERT INTO accounts (balance)
            VALUES ($1)
            RETURNING id, balance, frozen, realized_pnl, total_trades, winning_trades,
                      losing_trades, created_at, updated_at
            ",
        )
        .bind(starting_balance)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into_account())
    }

    async fn account(&self, id: i64) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            r"
            SELECT id, balance, frozen, realized_pnl, total_trades, winning_trades,
                   losing_trades, created_at, updated_at
            FROM accounts WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(AccountRow::into_account))
    }

    async fn position(&self, id: i64) -> Result<Option<Position>> {
        let row = sqlx::query_as::<_, PositionRow>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(PositionRow::into_position).transpose()
    }

    async fn open_positions(&self, account_id: i64) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions \
             WHERE account_id = $1 AND status = 'open' ORDER BY id"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(PositionRow::into_position).collect()
    }

    async fn open_virtual_positions(
        &self,
        account_id: i64,
        direction: Direction,
    ) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions \
             WHERE account_id = $1 AND direction = $2 AND is_virtual AND status = 'open' \
             ORDER BY id"
        ))
        .bind(account_id)
        .bind(direction.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(PositionRow::into_position).collect()
    }

    async fn order(&self, id: i64) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(OrderRow::into_order).transpose()
    }

    async fn pending_limit_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status = 'pending' AND kind = 'limit' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(OrderRow::into_order).collect()
    }

    async fn recent_real_closes(
        &self,
        account_id: i64,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            r"
            SELECT id, account_id, position_id, order_id, symbol, direction, action,
                   quantity, price, fee, realized_pnl, is_virtual, executed_at
            FROM trades
            WHERE account_id = $1 AND direction = $2 AND action = 'close' AND NOT is_virtual
            ORDER BY id DESC
            LIMIT $3
            ",
        )
        .bind(account_id)
        .bind(direction.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TradeRow::into_trade).collect()
    }

    async fn insert_open(&self, insert: OpenInsert) -> Result<Position> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let balance: Option<(Decimal,)> =
            sqlx::query_as("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(insert.account_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let Some((balance,)) = balance else {
            return Err(EngineError::AccountNotFound {
                id: insert.account_id,
            });
        };

        if !insert.is_virtual {
            if balance < insert.reserve {
                return Err(EngineError::insufficient_balance(insert.reserve, balance));
            }
            sqlx::query(
                r"
                UPDATE accounts
                SET balance = balance - $2, frozen = frozen + $2, updated_at = $3
                WHERE id = $1
                ",
            )
            .bind(insert.account_id)
            .bind(insert.reserve)
            .bind(insert.opened_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let (position_id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO positions
                (account_id, symbol, direction, quantity, entry_price, leverage, margin,
                 reserved, liquidation_price, stop_loss, take_profit, status, is_virtual,
                 opened_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'open', $12, $13)
            RETURNING id
            ",
        )
        .bind(insert.account_id)
        .bind(&insert.symbol)
        .bind(insert.direction.as_str())
        .bind(insert.quantity)
        .bind(insert.entry_price)
        .bind(i32::try_from(insert.leverage).unwrap_or(1))
        .bind(insert.margin)
        .bind(insert.reserve)
        .bind(insert.liquidation_price)
        .bind(insert.stop_loss)
        .bind(insert.take_profit)
        .bind(insert.is_virtual)
        .bind(insert.opened_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let (order_id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO orders
                (account_id, position_id, symbol, direction, kind, status, quantity,
                 fill_price, leverage, reserved, stop_loss, take_profit, is_virtual,
                 created_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, 'filled', $6, $7, $8, 0, $9, $10, $11, $12, $12)
            RETURNING id
            ",
        )
        .bind(insert.account_id)
        .bind(position_id)
        .bind(&insert.symbol)
        .bind(insert.direction.as_str())
        .bind(insert.kind.as_str())
        .bind(insert.quantity)
        .bind(insert.entry_price)
        .bind(i32::try_from(insert.leverage).unwrap_or(1))
        .bind(insert.stop_loss)
        .bind(insert.take_profit)
        .bind(insert.is_virtual)
        .bind(insert.opened_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r"
            INSERT INTO trades
                (account_id, position_id, order_id, symbol, direction, action, quantity,
                 price, fee, is_virtual, executed_at)
            VALUES ($1, $2, $3, $4, $5, 'open', $6, $7, $8, $9, $10)
            ",
        )
        .bind(insert.account_id)
        .bind(position_id)
        .bind(order_id)
        .bind(&insert.symbol)
        .bind(insert.direction.as_str())
        .bind(insert.quantity)
        .bind(insert.entry_price)
        .bind(insert.open_fee)
        .bind(insert.is_virtual)
        .bind(insert.opened_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(Position {
            id: position_id,
            account_id: insert.account_id,
            symbol: insert.symbol,
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
        })
    }

    async fn insert_pending_order(&self, insert: PendingOrderInsert) -> Result<Order> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let balance: Option<(Decimal,)> =
            sqlx::query_as("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(insert.account_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let Some((balance,)) = balance else {
            return Err(EngineError::AccountNotFound {
                id: insert.account_id,
            });
        };

        if !insert.is_virtual {
            if balance < insert.reserve {
                return Err(EngineError::insufficient_balance(insert.reserve, balance));
            }
            sqlx::query(
                r"
                UPDATE accounts
                SET balance = balance - $2, frozen = frozen + $2, updated_at = $3
                WHERE id = $1
                ",
            )
            .bind(insert.account_id)
            .bind(insert.reserve)
            .bind(insert.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let (order_id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO orders
                (account_id, symbol, direction, kind, status, quantity, limit_price,
                 leverage, reserved, stop_loss, take_profit, is_virtual, created_at)
            VALUES ($1, $2, $3, 'limit', 'pending', $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            ",
        )
        .bind(insert.account_id)
        .bind(&insert.symbol)
        .bind(insert.direction.as_str())
        .bind(insert.quantity)
        .bind(insert.limit_price)
        .bind(i32::try_from(insert.leverage).unwrap_or(1))
        .bind(insert.reserve)
        .bind(insert.stop_loss)
        .bind(insert.take_profit)
        .bind(insert.is_virtual)
        .bind(insert.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(Order {
            id: order_id,
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
        })
    }

    async fn apply_close(&self, apply: CloseApply) -> Result<CloseApplied> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query_as::<_, PositionRow>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1 FOR UPDATE"
        ))
        .bind(apply.position_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(CloseApplied::NotFound);
        };
        let position = row.into_position()?;
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
            sqlx::query(
                r"
                UPDATE positions
                SET status = 'closed', quantity = 0, margin = 0, reserved = 0,
                    close_price = $2, close_reason = $3, realized_pnl = $4, closed_at = $5
                WHERE id = $1
                ",
            )
            .bind(apply.position_id)
            .bind(apply.exit_price)
            .bind(apply.reason.as_str())
            .bind(apply.realized_pnl)
            .bind(apply.closed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            updated.status = PositionStatus::Closed;
            updated.quantity = Decimal::ZERO;
            updated.margin = Decimal::ZERO;
            updated.reserved = Decimal::ZERO;
            updated.close_price = Some(apply.exit_price);
            updated.close_reason = Some(apply.reason);
            updated.realized_pnl = Some(apply.realized_pnl);
            updated.closed_at = Some(apply.closed_at);
        } else {
            sqlx::query(
                r"
                UPDATE positions
                SET quantity = quantity - $2, margin = margin - $3, reserved = reserved - $4
                WHERE id = $1
                ",
            )
            .bind(apply.position_id)
            .bind(apply.close_quantity)
            .bind(apply.margin_release)
            .bind(apply.reserve_release)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            updated.quantity -= apply.close_quantity;
            updated.margin -= apply.margin_release;
            updated.reserved -= apply.reserve_release;
        }

        if !position.is_virtual {
            // Breakeven bumps neither counter.
            let won = apply.realized_pnl > Decimal::ZERO;
            let lost = apply.realized_pnl < Decimal::ZERO;
            sqlx::query(
                r"
                UPDATE accounts
                SET frozen = frozen - $2,
                    balance = balance + $3,
                    realized_pnl = realized_pnl + $4,
                    total_trades = total_trades + $5,
                    winning_trades = winning_trades + $6,
                    losing_trades = losing_trades + $7,
                    updated_at = $8
                WHERE id = $1
                ",
            )
            .bind(position.account_id)
            .bind(apply.reserve_release)
            .bind(apply.balance_credit)
            .bind(apply.realized_pnl)
            .bind(i64::from(apply.full_close))
            .bind(i64::from(apply.full_close && won))
            .bind(i64::from(apply.full_close && lost))
            .bind(apply.closed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query(
            r"
            INSERT INTO trades
                (account_id, position_id, symbol, direction, action, quantity, price,
                 fee, realized_pnl, is_virtual, executed_at)
            VALUES ($1, $2, $3, $4, 'close', $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(position.account_id)
        .bind(position.id)
        .bind(&position.symbol)
        .bind(position.direction.as_str())
        .bind(apply.close_quantity)
        .bind(apply.exit_price)
        .bind(apply.close_fee)
        .bind(apply.realized_pnl)
        .bind(position.is_virtual)
        .bind(apply.closed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        if apply.full_close {
            Ok(CloseApplied::Closed(updated))
        } else {
            Ok(CloseApplied::Partial(updated))
        }
    }

    async fn resolve_order(&self, order_id: i64, status: OrderStatus) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(false);
        };
        let order = row.into_order()?;
        if order.status != OrderStatus::Pending {
            return Ok(false);
        }

        let now = Utc::now();
        sqlx::query("UPDATE orders SET status = $2, resolved_at = $3 WHERE id = $1")
            .bind(order_id)
            .bind(status.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if !order.is_virtual && order.reserved > Decimal::ZERO {
            sqlx::query(
                r"
                UPDATE accounts
                SET frozen = frozen - $2, balance = balance + $2, updated_at = $3
                WHERE id = $1
                ",
            )
            .bind(order.account_id)
            .bind(order.reserved)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn fill_limit_order(&self, fill: LimitFill) -> Result<Option<Position>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(fill.order_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let order = row.into_order()?;
        if order.status != OrderStatus::Pending {
            return Ok(None);
        }

        let (position_id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO positions
                (account_id, symbol, direction, quantity, entry_price, leverage, margin,
                 reserved, liquidation_price, stop_loss, take_profit, status, is_virtual,
                 opened_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'open', $12, $13)
            RETURNING id
            ",
        )
        .bind(order.account_id)
        .bind(&order.symbol)
        .bind(order.direction.as_str())
        .bind(order.quantity)
        .bind(fill.fill_price)
        .bind(i32::try_from(order.leverage).unwrap_or(1))
        .bind(fill.margin)
        .bind(order.reserved)
        .bind(fill.liquidation_price)
        .bind(order.stop_loss)
        .bind(order.take_profit)
        .bind(order.is_virtual)
        .bind(fill.filled_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r"
            UPDATE orders
            SET status = 'filled', fill_price = $2, position_id = $3, resolved_at = $4
            WHERE id = $1
            ",
        )
        .bind(fill.order_id)
        .bind(fill.fill_price)
        .bind(position_id)
        .bind(fill.filled_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r"
            INSERT INTO trades
                (account_id, position_id, order_id, symbol, direction, action, quantity,
                 price, fee, is_virtual, executed_at)
            VALUES ($1, $2, $3, $4, $5, 'open', $6, $7, $8, $9, $10)
            ",
        )
        .bind(order.account_id)
        .bind(position_id)
        .bind(fill.order_id)
        .bind(&order.symbol)
        .bind(order.direction.as_str())
        .bind(order.quantity)
        .bind(fill.fill_price)
        .bind(fill.open_fee)
        .bind(order.is_virtual)
        .bind(fill.filled_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(Some(Position {
            id: position_id,
            account_id: order.account_id,
            symbol: order.symbol,
            direction: order.direction,
            quantity: order.quantity,
            entry_price: fill.fill_price,
            leverage: order.leverage,
            margin: fill.margin,
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
        }))
    }

    async fn set_peak_profit(&self, position_id: i64, peak_pct: f64) -> Result<()> {
        sqlx::query("UPDATE positions SET peak_profit_pct = $2 WHERE id = $1")
            .bind(position_id)
            .bind(peak_pct)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_strings_round_trip() {
        for direction in [Direction::Long, Direction::Short] {
            assert_eq!(parse_direction(direction.as_str()).unwrap(), direction);
        }
        for status in [
            OrderStatus::Pending,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Expired,
        ] {
            assert_eq!(parse_order_status(status.as_str()).unwrap(), status);
        }
        for reason in [
            CloseReason::StopLoss,
            CloseReason::TrailingStop,
            CloseReason::SentinelCleanup,
        ] {
            assert_eq!(parse_close_reason(reason.as_str()).unwrap(), reason);
        }
        assert!(parse_direction("sideways").is_err());
    }
}
