//! Account/position lifecycle orchestration.
//!
//! The ledger owns the money arithmetic: margin, fees, reservations, and
//! realized P&L are all computed here, then handed to the [`LedgerStore`] as
//! one fully-specified atomic mutation. Concurrency is resolved by the store's
//! predicates, so two monitors racing to close the same position produce one
//! close and one `AlreadyClosed`, never a double credit.

use crate::math;
use perp_core::{
    Account, CloseApplied, CloseApply, CloseReason, Direction, EngineError, LedgerStore, LimitFill,
    OpenInsert, Order, OrderKind, OrderStatus, PendingOrderInsert, Position, PriceSource, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fee and margin parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Taker fee rate applied to notional on both open and close.
    pub fee_rate: Decimal,
    /// Maintenance margin rate used in the liquidation closed form.
    pub maintenance_rate: Decimal,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            // 5 bps taker, 0.5% maintenance.
            fee_rate: Decimal::new(5, 4),
            maintenance_rate: Decimal::new(5, 3),
        }
    }
}

/// A request to open exposure, by market or limit.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub account_id: i64,
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub leverage: u32,
    pub kind: OrderKind,
    /// Required for limit opens, ignored for market opens.
    pub limit_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub is_virtual: bool,
}

/// What an open produced.
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    /// Filled immediately; the position is open.
    Opened(Position),
    /// Limit price not yet marketable; the order is queued with its
    /// reservation frozen.
    Queued(Order),
}

/// A request to close some or all of a position.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub position_id: i64,
    /// `None` closes the full open quantity.
    pub quantity: Option<Decimal>,
    /// `None` fetches the current price from the price source.
    pub exit_price: Option<Decimal>,
    pub reason: CloseReason,
}

/// Summary of a landed full close.
#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub position: Position,
    pub exit_price: Decimal,
    /// Directional P&L before fees.
    pub pnl: Decimal,
    pub close_fee: Decimal,
    /// P&L net of the close fee; what was credited against the margin.
    pub realized_pnl: Decimal,
    pub reason: CloseReason,
}

/// What a close produced.
#[derive(Debug, Clone)]
pub enum CloseOutcome {
    Closed(ClosedPosition),
    /// Partial close landed; the position remains open with reduced size.
    PartiallyClosed(Position),
    /// Another closer won the race, or the position was already closed.
    AlreadyClosed,
    NotFound,
}

/// The lifecycle ledger.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    prices: Arc<dyn PriceSource>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        prices: Arc<dyn PriceSource>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            prices,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn LedgerStore> {
        Arc::clone(&self.store)
    }

    /// Creates an account with a starting balance.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on persistence failure.
    pub async fn create_account(&self, starting_balance: Decimal) -> Result<Account> {
        self.store.create_account(starting_balance).await
    }

    pub async fn account(&self, id: i64) -> Result<Option<Account>> {
        self.store.account(id).await
    }

    pub async fn position(&self, id: i64) -> Result<Option<Position>> {
        self.store.position(id).await
    }

    pub async fn open_positions(&self, account_id: i64) -> Result<Vec<Position>> {
        self.store.open_positions(account_id).await
    }

    /// Opens a position or queues a limit order.
    ///
    /// Market opens fill at the current price. Limit opens fill immediately
    /// when already marketable (long at or below the limit, short at or
    /// above), otherwise the reservation is frozen and the order queued.
    ///
    /// # Errors
    ///
    /// `InvalidQuantity` for non-positive size, `PriceUnavailable` when a
    /// market open has no price, `InsufficientBalance` when the reservation
    /// does not fit the available balance.
    pub async fn open(&self, request: OpenRequest) -> Result<OpenOutcome> {
        if request.quantity <= Decimal::ZERO {
            return Err(EngineError::InvalidQuantity {
                quantity: request.quantity,
            });
        }
        let leverage = request.leverage.max(1);

        let current = self.current_price(&request.symbol).await?;

        if request.kind == OrderKind::Limit {
            let limit_price = request.limit_price.ok_or_else(|| {
                EngineError::Config("limit open requires a limit price".to_string())
            })?;
            if limit_price <= Decimal::ZERO {
                return Err(EngineError::InvalidQuantity {
                    quantity: limit_price,
                });
            }
            let marketable = match (current, request.direction) {
                (Some(price), Direction::Long) => price <= limit_price,
                (Some(price), Direction::Short) => price >= limit_price,
                (None, _) => false,
            };
            if !marketable {
                return self.queue_limit(request, limit_price, leverage).await;
            }
        }

        let entry_price = match request.kind {
            OrderKind::Market => current
                .ok_or_else(|| EngineError::price_unavailable(request.symbol.clone()))?,
            // Marketable limit: fill at the current price, which is at least
            // as good as the limit.
            OrderKind::Limit => current
                .ok_or_else(|| EngineError::price_unavailable(request.symbol.clone()))?,
        };

        let notional = entry_price * request.quantity;
        let margin = math::margin_for(notional, leverage);
        let open_fee = notional * self.config.fee_rate;
        let reserve = if request.is_virtual {
            Decimal::ZERO
        } else {
            margin + open_fee
        };
        let liquidation_price = math::liquidation_price(
            entry_price,
            leverage,
            self.config.maintenance_rate,
            request.direction,
        );

        let position = self
            .store
            .insert_open(OpenInsert {
                account_id: request.account_id,
                symbol: request.symbol.clone(),
                direction: request.direction,
                kind: request.kind,
                quantity: request.quantity,
                entry_price,
                leverage,
                margin,
                reserve,
                open_fee,
                liquidation_price,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                is_virtual: request.is_virtual,
                opened_at: Utc::now(),
            })
            .await?;

        info!(
            position_id = position.id,
            symbol = %position.symbol,
            direction = %position.direction,
            %entry_price,
            %margin,
            virtual_ = request.is_virtual,
            "position opened"
        );
        Ok(OpenOutcome::Opened(position))
    }

    async fn queue_limit(
        &self,
        request: OpenRequest,
        limit_price: Decimal,
        leverage: u32,
    ) -> Result<OpenOutcome> {
        // Reservation is sized from the limit price, which is exactly what
        // the fill will cost.
        let notional = limit_price * request.quantity;
        let reserve = if request.is_virtual {
            Decimal::ZERO
        } else {
            math::margin_for(notional, leverage) + notional * self.config.fee_rate
        };

        let order = self
            .store
            .insert_pending_order(PendingOrderInsert {
                account_id: request.account_id,
                symbol: request.symbol,
                direction: request.direction,
                quantity: request.quantity,
                limit_price,
                leverage,
                reserve,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                is_virtual: request.is_virtual,
                created_at: Utc::now(),
            })
            .await?;

        info!(
            order_id = order.id,
            symbol = %order.symbol,
            direction = %order.direction,
            %limit_price,
            "limit order queued"
        );
        Ok(OpenOutcome::Queued(order))
    }

    /// Closes some or all of a position at the given or current price.
    ///
    /// Idempotent under races: the losing closer observes `AlreadyClosed`.
    ///
    /// # Errors
    ///
    /// `PriceUnavailable` when no exit price can be resolved,
    /// `InvalidQuantity` when the requested size exceeds the open quantity.
    pub async fn close(&self, request: CloseRequest) -> Result<CloseOutcome> {
        let Some(position) = self.store.position(request.position_id).await? else {
            return Ok(CloseOutcome::NotFound);
        };
        if !position.is_open() {
            return Ok(CloseOutcome::AlreadyClosed);
        }

        let exit_price = match request.exit_price {
            Some(price) => price,
            None => self
                .current_price(&position.symbol)
                .await?
                .ok_or_else(|| EngineError::price_unavailable(position.symbol.clone()))?,
        };

        let close_quantity = request.quantity.unwrap_or(position.quantity);
        if close_quantity <= Decimal::ZERO || close_quantity > position.quantity {
            return Err(EngineError::InvalidQuantity {
                quantity: close_quantity,
            });
        }
        let full_close = close_quantity == position.quantity;
        let fraction = close_quantity / position.quantity;

        let pnl = position
            .direction
            .pnl(position.entry_price, exit_price, close_quantity);
        let close_fee = exit_price * close_quantity * self.config.fee_rate;
        let realized_pnl = pnl - close_fee;

        let (margin_release, reserve_release, balance_credit) = if position.is_virtual {
            (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
        } else {
            let margin_release = position.margin * fraction;
            let reserve_release = position.reserved * fraction;
            (margin_release, reserve_release, margin_release + realized_pnl)
        };

        let apply = CloseApply {
            position_id: position.id,
            expected_quantity: position.quantity,
            close_quantity,
            exit_price,
            pnl,
            close_fee,
            realized_pnl,
            margin_release,
            reserve_release,
            balance_credit,
            full_close,
            reason: request.reason,
            closed_at: Utc::now(),
        };

        let applied = match self.store.apply_close(apply).await {
            Ok(applied) => applied,
            Err(EngineError::ConcurrencyConflict { id }) => {
                // The quantity changed under us (a partial close landed).
                // Re-read once: a closed position means the race is benign.
                debug!(position_id = id, "close lost quantity race, re-reading");
                match self.store.position(id).await? {
                    Some(p) if !p.is_open() => return Ok(CloseOutcome::AlreadyClosed),
                    Some(_) => return Err(EngineError::ConcurrencyConflict { id }),
                    None => return Ok(CloseOutcome::NotFound),
                }
            }
            Err(err) => return Err(err),
        };

        match applied {
            CloseApplied::Closed(position) => {
                info!(
                    position_id = position.id,
                    symbol = %position.symbol,
                    %exit_price,
                    %realized_pnl,
                    reason = %request.reason,
                    "position closed"
                );
                Ok(CloseOutcome::Closed(ClosedPosition {
                    position,
                    exit_price,
                    pnl,
                    close_fee,
                    realized_pnl,
                    reason: request.reason,
                }))
            }
            CloseApplied::Partial(position) => {
                info!(
                    position_id = position.id,
                    remaining = %position.quantity,
                    %realized_pnl,
                    "position partially closed"
                );
                Ok(CloseOutcome::PartiallyClosed(position))
            }
            CloseApplied::AlreadyClosed => {
                debug!(position_id = request.position_id, "close raced, already closed");
                Ok(CloseOutcome::AlreadyClosed)
            }
            CloseApplied::NotFound => Ok(CloseOutcome::NotFound),
        }
    }

    /// Fills a pending limit order at its limit price.
    ///
    /// Returns `None` when the order was already resolved.
    ///
    /// # Errors
    ///
    /// `OrderNotFound` for unknown ids, `Storage` on persistence failure.
    pub async fn fill_limit_order(&self, order_id: i64) -> Result<Option<Position>> {
        let order = self
            .store
            .order(order_id)
            .await?
            .ok_or(EngineError::OrderNotFound { id: order_id })?;
        if order.status != OrderStatus::Pending {
            return Ok(None);
        }
        let fill_price = order.limit_price.ok_or_else(|| {
            EngineError::Config(format!("pending order {order_id} has no limit price"))
        })?;

        let notional = fill_price * order.quantity;
        let margin = math::margin_for(notional, order.leverage);
        let open_fee = notional * self.config.fee_rate;
        let liquidation_price = math::liquidation_price(
            fill_price,
            order.leverage,
            self.config.maintenance_rate,
            order.direction,
        );

        let filled = self
            .store
            .fill_limit_order(LimitFill {
                order_id,
                fill_price,
                margin,
                open_fee,
                liquidation_price,
                filled_at: Utc::now(),
            })
            .await?;

        if let Some(position) = &filled {
            info!(
                order_id,
                position_id = position.id,
                symbol = %position.symbol,
                %fill_price,
                "limit order filled"
            );
        }
        Ok(filled)
    }

    /// Cancels or expires a pending limit order, releasing its reservation.
    /// Returns false when the order was no longer pending.
    ///
    /// # Errors
    ///
    /// `Storage` on persistence failure.
    pub async fn resolve_limit_order(&self, order_id: i64, status: OrderStatus) -> Result<bool> {
        let resolved = self.store.resolve_order(order_id, status).await?;
        if resolved {
            info!(order_id, status = status.as_str(), "limit order resolved");
        } else {
            debug!(order_id, "order already resolved");
        }
        Ok(resolved)
    }

    /// Persists the running peak-profit marker used by trailing exits.
    pub async fn set_peak_profit(&self, position_id: i64, peak_pct: f64) -> Result<()> {
        self.store.set_peak_profit(position_id, peak_pct).await
    }

    /// Account equity: balance + frozen + unrealized P&L of open real
    /// positions at current prices. Positions without a price contribute
    /// their entry-price mark (zero unrealized).
    ///
    /// # Errors
    ///
    /// `AccountNotFound` for unknown ids.
    pub async fn equity(&self, account_id: i64) -> Result<Decimal> {
        let account = self
            .store
            .account(account_id)
            .await?
            .ok_or(EngineError::AccountNotFound { id: account_id })?;
        let mut equity = account.balance + account.frozen;
        for position in self.store.open_positions(account_id).await? {
            if position.is_virtual {
                continue;
            }
            match self.current_price(&position.symbol).await? {
                Some(price) => equity += position.unrealized_pnl(price),
                None => {
                    warn!(
                        position_id = position.id,
                        symbol = %position.symbol,
                        "no price for equity mark, using entry"
                    );
                }
            }
        }
        Ok(equity)
    }

    async fn current_price(&self, symbol: &str) -> Result<Option<Decimal>> {
        self.prices
            .price(symbol)
            .await
            .map_err(|e| EngineError::storage(format!("price source: {e}")))
    }
}
