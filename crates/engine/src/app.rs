//! Component wiring and the run loop.

use crate::config::{AppConfig, StorageKind};
use crate::feed::RestCandleSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use perp_breaker::AdmissionController;
use perp_core::{
    BreakerAudit, CandleSource, Direction, LedgerStore, Position, PriceSource, RegimeAudit,
};
use perp_data::{BreakerAuditRepository, DatabaseClient, PgStore, RegimeAuditRepository};
use perp_executor::{FillHook, LimitOrderExecutor};
use perp_ledger::{Ledger, MemoryStore};
use perp_monitor::{MonitorSupervisor, SentinelCloseHook, TieredPriceSource};
use perp_regime::RegimeClassifier;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Routes monitor-observed sentinel closes into the breaker's recovery
/// streak.
struct BreakerFeedback {
    controller: Arc<AdmissionController>,
}

#[async_trait]
impl SentinelCloseHook for BreakerFeedback {
    async fn on_sentinel_close(
        &self,
        account_id: i64,
        direction: Direction,
        realized_pnl: Decimal,
    ) -> perp_core::Result<()> {
        self.controller
            .record_sentinel_close(account_id, direction, realized_pnl)
            .await
    }
}

/// Puts a monitor on every position the limit executor fills.
struct MonitorOnFill {
    supervisor: Arc<MonitorSupervisor>,
}

#[async_trait]
impl FillHook for MonitorOnFill {
    async fn on_fill(&self, position: &Position) -> perp_core::Result<()> {
        self.supervisor.start(position.id).await;
        Ok(())
    }
}

pub async fn run(config: AppConfig) -> Result<()> {
    let (store, regime_audit, breaker_audit): (
        Arc<dyn LedgerStore>,
        Option<Arc<dyn RegimeAudit>>,
        Option<Arc<dyn BreakerAudit>>,
    ) = match config.storage {
        StorageKind::Postgres => {
            let client = DatabaseClient::connect(&config.database)
                .await
                .context("connecting to database")?;
            client.ensure_schema().await?;
            (
                Arc::new(PgStore::new(&client)),
                Some(Arc::new(RegimeAuditRepository::new(&client))),
                Some(Arc::new(BreakerAuditRepository::new(&client))),
            )
        }
        StorageKind::Memory => {
            info!("using the in-memory store, nothing will be persisted");
            (Arc::new(MemoryStore::new()), None, None)
        }
    };

    let candles: Arc<dyn CandleSource> =
        Arc::new(RestCandleSource::new(config.market_data.clone())?);
    let prices: Arc<dyn PriceSource> = Arc::new(TieredPriceSource::new(
        None,
        Some(Arc::clone(&candles)),
        config.price_feed.clone(),
    )?);

    let ledger = Ledger::new(store, Arc::clone(&prices), config.ledger.clone());

    let account_id = match config.account.id {
        Some(id) => {
            let account = ledger
                .account(id)
                .await?
                .with_context(|| format!("account {id} not found"))?;
            info!(
                account_id = account.id,
                balance = %account.balance,
                frozen = %account.frozen,
                "resuming account"
            );
            account.id
        }
        None => {
            let account = ledger
                .create_account(config.account.starting_balance)
                .await?;
            info!(
                account_id = account.id,
                balance = %account.balance,
                "created paper account"
            );
            account.id
        }
    };

    let classifier = Arc::new(RegimeClassifier::new(
        Arc::clone(&candles),
        regime_audit,
        config.classifier.clone(),
    ));
    let controller = Arc::new(AdmissionController::new(
        ledger.clone(),
        breaker_audit,
        config.breaker.clone(),
    ));

    let supervisor = Arc::new(MonitorSupervisor::new(
        ledger.clone(),
        Arc::clone(&prices),
        Arc::clone(&candles),
        Some(Arc::clone(&classifier)),
        Some(Arc::new(BreakerFeedback {
            controller: Arc::clone(&controller),
        }) as Arc<dyn SentinelCloseHook>),
        config.monitor.clone(),
    ));
    let restored = supervisor.restore(account_id).await?;

    let executor = Arc::new(LimitOrderExecutor::new(
        ledger.clone(),
        Arc::clone(&prices),
        Arc::clone(&candles),
        Some(Arc::new(MonitorOnFill {
            supervisor: Arc::clone(&supervisor),
        }) as Arc<dyn FillHook>),
        config.executor.clone(),
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let executor_task = tokio::spawn({
        let executor = Arc::clone(&executor);
        async move { executor.run(stop_rx).await }
    });

    info!(account_id, restored_monitors = restored, "engine running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    // Stop taking new fills first, then let every monitor's in-flight
    // close land.
    let _ = stop_tx.send(true);
    let _ = executor_task.await;
    supervisor.shutdown().await;
    info!("engine stopped");
    Ok(())
}
