//! Resting limit order scanner.
//!
//! Every few seconds walks the pending limit orders: aged orders expire with
//! their reservation released, triggered orders pass a trend and a momentum
//! veto before filling at the limit price. Expiry cancels the order; it is
//! never converted to a market order.

use async_trait::async_trait;
use chrono::Utc;
use perp_core::{CandleSource, Direction, Order, OrderStatus, Position, PriceSource, Result, Timeframe};
use perp_ledger::Ledger;
use perp_regime::indicators::{rsi, sma};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub scan_interval_secs: u64,
    /// Pending orders older than this are cancelled, never market-converted.
    pub order_timeout_secs: i64,
    /// Timeframe the veto indicators are computed on.
    pub veto_timeframe: Timeframe,
    /// Candle history fetched for the vetoes.
    pub veto_candles: usize,
    pub ma_fast: usize,
    pub ma_slow: usize,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 5,
            order_timeout_secs: 3600,
            veto_timeframe: Timeframe::M5,
            veto_candles: 50,
            ma_fast: 9,
            ma_slow: 21,
            rsi_period: 14,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
        }
    }
}

/// Invoked after a limit order fills, so the new position picks up a monitor.
#[async_trait]
pub trait FillHook: Send + Sync {
    async fn on_fill(&self, position: &Position) -> Result<()>;
}

/// What one pass over the pending orders did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub filled: usize,
    pub vetoed: usize,
    pub expired: usize,
}

pub struct LimitOrderExecutor {
    ledger: Ledger,
    prices: Arc<dyn PriceSource>,
    candles: Arc<dyn CandleSource>,
    hook: Option<Arc<dyn FillHook>>,
    config: ExecutorConfig,
}

impl LimitOrderExecutor {
    pub fn new(
        ledger: Ledger,
        prices: Arc<dyn PriceSource>,
        candles: Arc<dyn CandleSource>,
        hook: Option<Arc<dyn FillHook>>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            ledger,
            prices,
            candles,
            hook,
            config,
        }
    }

    /// Scan loop; exits when cancelled.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.scan_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        debug!("limit order executor stopped");
                        return;
                    }
                }
                _ = interval.tick() => {
                    if let Err(err) = self.scan_once().await {
                        warn!(error = %err, "limit order scan failed");
                    }
                }
            }
        }
    }

    /// One pass over all pending limit orders. A failure on one order is
    /// logged and the rest of the scan continues.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the pending orders cannot be listed.
    pub async fn scan_once(&self) -> Result<ScanReport> {
        let orders = self.ledger.store().pending_limit_orders().await?;
        let mut report = ScanReport {
            scanned: orders.len(),
            ..ScanReport::default()
        };
        let mut price_cache: HashMap<String, Option<Decimal>> = HashMap::new();

        for order in orders {
            match self.process(&order, &mut price_cache).await {
                Ok(outcome) => match outcome {
                    OrderOutcome::Filled => report.filled += 1,
                    OrderOutcome::Vetoed => report.vetoed += 1,
                    OrderOutcome::Expired => report.expired += 1,
                    OrderOutcome::Waiting => {}
                },
                Err(err) => {
                    warn!(order_id = order.id, error = %err, "order scan failed, skipping");
                }
            }
        }
        Ok(report)
    }

    async fn process(
        &self,
        order: &Order,
        price_cache: &mut HashMap<String, Option<Decimal>>,
    ) -> Result<OrderOutcome> {
        let age_secs = (Utc::now() - order.created_at).num_seconds();
        if age_secs >= self.config.order_timeout_secs {
            if self
                .ledger
                .resolve_limit_order(order.id, OrderStatus::Expired)
                .await?
            {
                info!(order_id = order.id, age_secs, "limit order expired");
                return Ok(OrderOutcome::Expired);
            }
            return Ok(OrderOutcome::Waiting);
        }

        let price = match price_cache.get(&order.symbol) {
            Some(cached) => *cached,
            None => {
                let fetched = match self.prices.price(&order.symbol).await {
                    Ok(price) => price,
                    Err(err) => {
                        warn!(symbol = %order.symbol, error = %err, "price fetch failed");
                        None
                    }
                };
                price_cache.insert(order.symbol.clone(), fetched);
                fetched
            }
        };
        let Some(price) = price else {
            return Ok(OrderOutcome::Waiting);
        };
        let Some(limit_price) = order.limit_price else {
            // A pending limit order always carries its limit; treat a bare
            // one as unfillable rather than guessing a price.
            warn!(order_id = order.id, "pending limit order has no limit price");
            return Ok(OrderOutcome::Waiting);
        };

        let triggered = match order.direction {
            Direction::Long => price <= limit_price,
            Direction::Short => price >= limit_price,
        };
        if !triggered {
            return Ok(OrderOutcome::Waiting);
        }

        if let Some(veto) = self.veto_reason(order).await {
            if self
                .ledger
                .resolve_limit_order(order.id, OrderStatus::Cancelled)
                .await?
            {
                info!(
                    order_id = order.id,
                    symbol = %order.symbol,
                    direction = %order.direction,
                    veto,
                    "limit order vetoed, cancelling"
                );
                return Ok(OrderOutcome::Vetoed);
            }
            return Ok(OrderOutcome::Waiting);
        }

        let Some(position) = self.ledger.fill_limit_order(order.id).await? else {
            // Another scanner resolved it first.
            debug!(order_id = order.id, "order no longer pending, skipping fill");
            return Ok(OrderOutcome::Waiting);
        };
        info!(
            order_id = order.id,
            position_id = position.id,
            symbol = %position.symbol,
            entry_price = %position.entry_price,
            "limit order filled"
        );
        if let Some(hook) = &self.hook {
            if let Err(err) = hook.on_fill(&position).await {
                warn!(position_id = position.id, error = %err, "fill hook failed");
            }
        }
        Ok(OrderOutcome::Filled)
    }

    /// Returns the veto that blocks this fill, if any. Thin history vetoes
    /// nothing.
    async fn veto_reason(&self, order: &Order) -> Option<&'static str> {
        let candles = match self
            .candles
            .candles(&order.symbol, self.config.veto_timeframe, self.config.veto_candles)
            .await
        {
            Ok(candles) => candles,
            Err(err) => {
                warn!(symbol = %order.symbol, error = %err, "veto candle fetch failed");
                return None;
            }
        };
        let closes: Vec<f64> = candles.iter().map(|c| c.close_f64()).collect();

        let fast = last_value(&sma(&closes, self.config.ma_fast));
        let slow = last_value(&sma(&closes, self.config.ma_slow));
        if let (Some(fast), Some(slow)) = (fast, slow) {
            let against = match order.direction {
                Direction::Long => fast < slow,
                Direction::Short => fast > slow,
            };
            if against {
                return Some("trend_cross");
            }
        }

        if let Some(rsi) = last_value(&rsi(&closes, self.config.rsi_period)) {
            let against = match order.direction {
                Direction::Long => rsi > self.config.rsi_overbought,
                Direction::Short => rsi < self.config.rsi_oversold,
            };
            if against {
                return Some("rsi_momentum");
            }
        }
        None
    }
}

enum OrderOutcome {
    Filled,
    Vetoed,
    Expired,
    Waiting,
}

fn last_value(series: &[f64]) -> Option<f64> {
    series.last().copied().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use perp_core::{Candle, OrderKind};
    use perp_ledger::{LedgerConfig, MemoryStore, OpenOutcome, OpenRequest};
    use rust_decimal_macros::dec;

    struct TestPrices(Mutex<Decimal>);

    #[async_trait]
    impl PriceSource for TestPrices {
        async fn price(&self, _symbol: &str) -> anyhow::Result<Option<Decimal>> {
            Ok(Some(*self.0.lock()))
        }
    }

    /// Serves a fixed close series, most recent last.
    struct TestCandles(Vec<f64>);

    #[async_trait]
    impl CandleSource for TestCandles {
        async fn candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            count: usize,
        ) -> anyhow::Result<Vec<Candle>> {
            let start = self.0.len().saturating_sub(count);
            Ok(self.0[start..]
                .iter()
                .enumerate()
                .map(|(i, close)| {
                    let price = Decimal::try_from(*close).unwrap_or(Decimal::ZERO);
                    Candle {
                        timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 300, 0).unwrap(),
                        open: price,
                        high: price,
                        low: price,
                        close: price,
                        volume: Decimal::ONE,
                    }
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingHook(Mutex<Vec<i64>>);

    #[async_trait]
    impl FillHook for RecordingHook {
        async fn on_fill(&self, position: &Position) -> Result<()> {
            self.0.lock().push(position.id);
            Ok(())
        }
    }

    struct Rig {
        ledger: Ledger,
        prices: Arc<TestPrices>,
        hook: Arc<RecordingHook>,
        executor: LimitOrderExecutor,
        account_id: i64,
    }

    async fn rig(closes: Vec<f64>, config: ExecutorConfig) -> Rig {
        let prices = Arc::new(TestPrices(Mutex::new(dec!(48500))));
        let ledger = Ledger::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&prices) as Arc<dyn PriceSource>,
            LedgerConfig::default(),
        );
        let account = ledger.create_account(dec!(100000)).await.unwrap();
        let hook = Arc::new(RecordingHook::default());
        let executor = LimitOrderExecutor::new(
            ledger.clone(),
            Arc::clone(&prices) as Arc<dyn PriceSource>,
            Arc::new(TestCandles(closes)),
            Some(Arc::clone(&hook) as Arc<dyn FillHook>),
            config,
        );
        Rig {
            ledger,
            prices,
            hook,
            executor,
            account_id: account.id,
        }
    }

    /// Flat closes: no moving-average cross, RSI stays neutral.
    fn flat_closes() -> Vec<f64> {
        vec![48500.0; 60]
    }

    /// A long history of falls drives the fast average under the slow one.
    fn falling_closes() -> Vec<f64> {
        (0..60).map(|i| 52000.0 - f64::from(i) * 60.0).collect()
    }

    /// A steady climb keeps the fast average on top and pins RSI near 100.
    fn rising_closes() -> Vec<f64> {
        (0..60).map(|i| 45000.0 + f64::from(i) * 60.0).collect()
    }

    async fn queue_long(rig: &Rig, limit: Decimal) -> i64 {
        let outcome = rig
            .ledger
            .open(OpenRequest {
                account_id: rig.account_id,
                symbol: "BTCUSDT".into(),
                direction: Direction::Long,
                quantity: dec!(0.1),
                leverage: 10,
                kind: OrderKind::Limit,
                limit_price: Some(limit),
                stop_loss: None,
                take_profit: None,
                is_virtual: false,
            })
            .await
            .unwrap();
        match outcome {
            OpenOutcome::Queued(order) => order.id,
            OpenOutcome::Opened(_) => panic!("expected the order to queue"),
        }
    }

    #[tokio::test]
    async fn triggered_order_fills_at_the_limit_price() {
        let rig = rig(flat_closes(), ExecutorConfig::default()).await;
        let order_id = queue_long(&rig, dec!(48000)).await;

        // Still above the limit: nothing happens.
        let report = rig.executor.scan_once().await.unwrap();
        assert_eq!(report.filled, 0);

        *rig.prices.0.lock() = dec!(47999);
        let report = rig.executor.scan_once().await.unwrap();
        assert_eq!(report.filled, 1);

        let order = rig.ledger.store().order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        let position_id = order.position_id.unwrap();
        let position = rig.ledger.position(position_id).await.unwrap().unwrap();
        assert!(position.is_open());
        assert_eq!(position.entry_price, dec!(48000));
        assert_eq!(*rig.hook.0.lock(), vec![position_id]);
    }

    #[tokio::test]
    async fn expired_order_is_cancelled_and_funds_released() {
        let config = ExecutorConfig {
            order_timeout_secs: 0,
            ..ExecutorConfig::default()
        };
        let rig = rig(flat_closes(), config).await;
        let order_id = queue_long(&rig, dec!(48000)).await;

        let before = rig.ledger.account(rig.account_id).await.unwrap().unwrap();
        assert!(before.frozen > Decimal::ZERO);

        let report = rig.executor.scan_once().await.unwrap();
        assert_eq!(report.expired, 1);

        let order = rig.ledger.store().order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Expired);
        let after = rig.ledger.account(rig.account_id).await.unwrap().unwrap();
        assert_eq!(after.frozen, Decimal::ZERO);
        assert_eq!(after.balance, dec!(100000));
        assert!(rig.hook.0.lock().is_empty());
    }

    #[tokio::test]
    async fn counter_trend_cross_vetoes_the_fill() {
        let rig = rig(falling_closes(), ExecutorConfig::default()).await;
        let order_id = queue_long(&rig, dec!(48000)).await;

        *rig.prices.0.lock() = dec!(47999);
        let report = rig.executor.scan_once().await.unwrap();
        assert_eq!(report.vetoed, 1);
        assert_eq!(report.filled, 0);

        let order = rig.ledger.store().order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.position_id.is_none());
        let account = rig.ledger.account(rig.account_id).await.unwrap().unwrap();
        assert_eq!(account.frozen, Decimal::ZERO);
    }

    #[tokio::test]
    async fn overbought_momentum_vetoes_a_long() {
        // The climb keeps the trend veto quiet for a long; RSI does the work.
        let rig = rig(rising_closes(), ExecutorConfig::default()).await;
        let order_id = queue_long(&rig, dec!(48000)).await;

        *rig.prices.0.lock() = dec!(47999);
        let report = rig.executor.scan_once().await.unwrap();
        assert_eq!(report.vetoed, 1);

        let order = rig.ledger.store().order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn untriggered_orders_keep_waiting() {
        let rig = rig(flat_closes(), ExecutorConfig::default()).await;
        let order_id = queue_long(&rig, dec!(48000)).await;

        for _ in 0..3 {
            let report = rig.executor.scan_once().await.unwrap();
            assert_eq!(report.scanned, 1);
            assert_eq!(report.filled + report.vetoed + report.expired, 0);
        }
        let order = rig.ledger.store().order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
    }
}
