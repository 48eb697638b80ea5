//! Actor-per-position supervision.
//!
//! One cooperative task per open position, keyed by position id with an
//! explicit start/stop/cancel lifecycle. Tasks remove themselves from the
//! registry when their position closes; stopping a monitor cancels its task
//! without touching the position.

use crate::monitor::{run_monitor, MonitorConfig, MonitorDeps};
use async_trait::async_trait;
use perp_core::{CandleSource, Direction, PriceSource, Result};
use perp_ledger::Ledger;
use perp_regime::RegimeClassifier;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Invoked when a monitored virtual position closes, feeding the outcome
/// back into the admission controller's recovery streak.
#[async_trait]
pub trait SentinelCloseHook: Send + Sync {
    async fn on_sentinel_close(
        &self,
        account_id: i64,
        direction: Direction,
        realized_pnl: Decimal,
    ) -> Result<()>;
}

struct MonitorHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Registry of live position monitors.
pub struct MonitorSupervisor {
    deps: Arc<MonitorDeps>,
    monitors: Arc<RwLock<HashMap<i64, MonitorHandle>>>,
}

impl MonitorSupervisor {
    pub fn new(
        ledger: Ledger,
        prices: Arc<dyn PriceSource>,
        candles: Arc<dyn CandleSource>,
        classifier: Option<Arc<RegimeClassifier>>,
        hook: Option<Arc<dyn SentinelCloseHook>>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            deps: Arc::new(MonitorDeps {
                ledger,
                prices,
                candles,
                classifier,
                hook,
                config,
            }),
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Starts monitoring a position. Idempotent per id.
    pub async fn start(&self, position_id: i64) {
        let mut monitors = self.monitors.write().await;
        if monitors.contains_key(&position_id) {
            return;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let deps = Arc::clone(&self.deps);
        let registry = Arc::clone(&self.monitors);
        let task = tokio::spawn(async move {
            run_monitor(deps, position_id, cancel_rx).await;
            registry.write().await.remove(&position_id);
        });
        monitors.insert(
            position_id,
            MonitorHandle {
                cancel: cancel_tx,
                task,
            },
        );
        info!(position_id, "monitor started");
    }

    /// Cancels a position's monitor without closing the position. An
    /// in-flight close is allowed to finish.
    pub async fn stop(&self, position_id: i64) {
        if let Some(handle) = self.monitors.write().await.remove(&position_id) {
            let _ = handle.cancel.send(true);
            info!(position_id, "monitor stopped");
        }
    }

    /// Restarts monitors for every open position of an account, after a
    /// process restart.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when open positions cannot be listed.
    pub async fn restore(&self, account_id: i64) -> Result<usize> {
        let positions = self.deps.ledger.open_positions(account_id).await?;
        let count = positions.len();
        for position in positions {
            self.start(position.id).await;
        }
        if count > 0 {
            info!(account_id, count, "monitors restored");
        }
        Ok(count)
    }

    /// Ids currently under monitoring.
    pub async fn monitored(&self) -> Vec<i64> {
        self.monitors.read().await.keys().copied().collect()
    }

    /// Cancels all monitors and waits for them to wind down.
    pub async fn shutdown(&self) {
        let handles: Vec<(i64, MonitorHandle)> =
            self.monitors.write().await.drain().collect();
        for (position_id, handle) in handles {
            let _ = handle.cancel.send(true);
            if let Err(err) = handle.task.await {
                warn!(position_id, error = %err, "monitor task join failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use perp_core::{
        Account, Candle, CloseApplied, CloseApply, CloseReason, LedgerStore, LimitFill,
        OpenInsert, Order, OrderKind, OrderStatus, PendingOrderInsert, Position, Timeframe, Trade,
    };
    use perp_ledger::{LedgerConfig, MemoryStore, OpenOutcome, OpenRequest};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct TestPrices(Mutex<Decimal>);

    #[async_trait]
    impl PriceSource for TestPrices {
        async fn price(&self, _symbol: &str) -> anyhow::Result<Option<Decimal>> {
            Ok(Some(*self.0.lock()))
        }
    }

    struct NoCandles;

    #[async_trait]
    impl CandleSource for NoCandles {
        async fn candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _count: usize,
        ) -> anyhow::Result<Vec<Candle>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        closes: Mutex<Vec<(Direction, Decimal)>>,
    }

    #[async_trait]
    impl SentinelCloseHook for RecordingHook {
        async fn on_sentinel_close(
            &self,
            _account_id: i64,
            direction: Direction,
            realized_pnl: Decimal,
        ) -> Result<()> {
            self.closes.lock().push((direction, realized_pnl));
            Ok(())
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            tick_interval_ms: 10,
            price_timeout_ms: 100,
            write_timeout_ms: 100,
            ..MonitorConfig::default()
        }
    }

    /// Delegates to a memory store except that closes never return, like an
    /// in-flight query on a dead database connection.
    struct StalledCloses {
        inner: MemoryStore,
    }

    #[async_trait]
    impl LedgerStore for StalledCloses {
        async fn create_account(&self, starting_balance: Decimal) -> Result<Account> {
            self.inner.create_account(starting_balance).await
        }

        async fn account(&self, id: i64) -> Result<Option<Account>> {
            self.inner.account(id).await
        }

        async fn position(&self, id: i64) -> Result<Option<Position>> {
            self.inner.position(id).await
        }

        async fn open_positions(&self, account_id: i64) -> Result<Vec<Position>> {
            self.inner.open_positions(account_id).await
        }

        async fn open_virtual_positions(
            &self,
            account_id: i64,
            direction: Direction,
        ) -> Result<Vec<Position>> {
            self.inner.open_virtual_positions(account_id, direction).await
        }

        async fn order(&self, id: i64) -> Result<Option<Order>> {
            self.inner.order(id).await
        }

        async fn pending_limit_orders(&self) -> Result<Vec<Order>> {
            self.inner.pending_limit_orders().await
        }

        async fn recent_real_closes(
            &self,
            account_id: i64,
            direction: Direction,
            limit: usize,
        ) -> Result<Vec<Trade>> {
            self.inner.recent_real_closes(account_id, direction, limit).await
        }

        async fn insert_open(&self, insert: OpenInsert) -> Result<Position> {
            self.inner.insert_open(insert).await
        }

        async fn insert_pending_order(&self, insert: PendingOrderInsert) -> Result<Order> {
            self.inner.insert_pending_order(insert).await
        }

        async fn apply_close(&self, _apply: CloseApply) -> Result<CloseApplied> {
            std::future::pending().await
        }

        async fn resolve_order(&self, order_id: i64, status: OrderStatus) -> Result<bool> {
            self.inner.resolve_order(order_id, status).await
        }

        async fn fill_limit_order(&self, fill: LimitFill) -> Result<Option<Position>> {
            self.inner.fill_limit_order(fill).await
        }

        async fn set_peak_profit(&self, position_id: i64, peak_pct: f64) -> Result<()> {
            self.inner.set_peak_profit(position_id, peak_pct).await
        }
    }

    struct Rig {
        ledger: Ledger,
        prices: Arc<TestPrices>,
        supervisor: MonitorSupervisor,
        hook: Arc<RecordingHook>,
        account_id: i64,
    }

    async fn rig() -> Rig {
        let prices = Arc::new(TestPrices(Mutex::new(dec!(50000))));
        let ledger = Ledger::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&prices) as Arc<dyn PriceSource>,
            LedgerConfig::default(),
        );
        let account = ledger.create_account(dec!(100000)).await.unwrap();
        let hook = Arc::new(RecordingHook::default());
        let supervisor = MonitorSupervisor::new(
            ledger.clone(),
            Arc::clone(&prices) as Arc<dyn PriceSource>,
            Arc::new(NoCandles),
            None,
            Some(Arc::clone(&hook) as Arc<dyn SentinelCloseHook>),
            fast_config(),
        );
        Rig {
            ledger,
            prices,
            supervisor,
            hook,
            account_id: account.id,
        }
    }

    async fn open(rig: &Rig, stop_loss: Option<Decimal>, is_virtual: bool) -> i64 {
        let outcome = rig
            .ledger
            .open(OpenRequest {
                account_id: rig.account_id,
                symbol: "BTCUSDT".into(),
                direction: Direction::Long,
                quantity: dec!(0.1),
                leverage: 10,
                kind: OrderKind::Market,
                limit_price: None,
                stop_loss,
                take_profit: None,
                is_virtual,
            })
            .await
            .unwrap();
        match outcome {
            OpenOutcome::Opened(p) => p.id,
            OpenOutcome::Queued(_) => panic!("expected immediate open"),
        }
    }

    async fn wait_until_closed(rig: &Rig, position_id: i64) {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let position = rig.ledger.position(position_id).await.unwrap().unwrap();
            if !position.is_open() {
                return;
            }
        }
        panic!("position {position_id} never closed");
    }

    #[tokio::test]
    async fn stop_loss_tick_closes_and_deregisters() {
        let rig = rig().await;
        let position_id = open(&rig, Some(dec!(49000)), false).await;
        rig.supervisor.start(position_id).await;

        *rig.prices.0.lock() = dec!(48999);
        wait_until_closed(&rig, position_id).await;

        let position = rig.ledger.position(position_id).await.unwrap().unwrap();
        assert_eq!(position.close_reason, Some(CloseReason::StopLoss));

        // The task removes itself from the registry.
        for _ in 0..100 {
            if rig.supervisor.monitored().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("monitor never deregistered");
    }

    #[tokio::test]
    async fn stopping_a_monitor_leaves_the_position_open() {
        let rig = rig().await;
        let position_id = open(&rig, Some(dec!(49000)), false).await;
        rig.supervisor.start(position_id).await;
        rig.supervisor.stop(position_id).await;

        // Price crosses the stop after cancellation: nobody is watching.
        *rig.prices.0.lock() = dec!(48000);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let position = rig.ledger.position(position_id).await.unwrap().unwrap();
        assert!(position.is_open());
        assert!(rig.supervisor.monitored().await.is_empty());
    }

    #[tokio::test]
    async fn virtual_close_reaches_the_sentinel_hook() {
        let rig = rig().await;
        let position_id = open(&rig, Some(dec!(49000)), true).await;
        rig.supervisor.start(position_id).await;

        *rig.prices.0.lock() = dec!(48999);
        wait_until_closed(&rig, position_id).await;
        // Give the hook call a beat to land after the close.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let closes = rig.hook.closes.lock();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, Direction::Long);
        assert!(closes[0].1 < Decimal::ZERO);
    }

    #[tokio::test]
    async fn stalled_close_write_cannot_wedge_a_monitor() {
        let prices = Arc::new(TestPrices(Mutex::new(dec!(50000))));
        let ledger = Ledger::new(
            Arc::new(StalledCloses {
                inner: MemoryStore::new(),
            }),
            Arc::clone(&prices) as Arc<dyn PriceSource>,
            LedgerConfig::default(),
        );
        let account = ledger.create_account(dec!(100000)).await.unwrap();
        let outcome = ledger
            .open(OpenRequest {
                account_id: account.id,
                symbol: "BTCUSDT".into(),
                direction: Direction::Long,
                quantity: dec!(0.1),
                leverage: 10,
                kind: OrderKind::Market,
                limit_price: None,
                stop_loss: Some(dec!(49000)),
                take_profit: None,
                is_virtual: false,
            })
            .await
            .unwrap();
        let OpenOutcome::Opened(position) = outcome else {
            panic!("expected immediate open");
        };

        let supervisor = MonitorSupervisor::new(
            ledger,
            Arc::clone(&prices) as Arc<dyn PriceSource>,
            Arc::new(NoCandles),
            None,
            None,
            fast_config(),
        );
        supervisor.start(position.id).await;

        // The stop triggers every tick, and every close hangs in the store.
        *prices.0.lock() = dec!(48999);
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The write budget failed those ticks, so the loop kept control and
        // cancellation still lands.
        tokio::time::timeout(Duration::from_secs(2), supervisor.shutdown())
            .await
            .expect("shutdown must not hang on a stalled store");
        assert!(supervisor.monitored().await.is_empty());
    }

    #[tokio::test]
    async fn restore_starts_monitors_for_open_positions() {
        let rig = rig().await;
        let a = open(&rig, None, false).await;
        let b = open(&rig, None, false).await;

        let restored = rig.supervisor.restore(rig.account_id).await.unwrap();
        assert_eq!(restored, 2);
        let mut monitored = rig.supervisor.monitored().await;
        monitored.sort_unstable();
        assert_eq!(monitored, vec![a, b]);

        rig.supervisor.shutdown().await;
        assert!(rig.supervisor.monitored().await.is_empty());
    }
}
