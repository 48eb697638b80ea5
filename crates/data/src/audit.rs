//! Audit repositories for regime and breaker history.
//!
//! Append-only; nothing in the engine reads these back, they exist for
//! offline analysis.

use anyhow::Result;
use async_trait::async_trait;
use perp_core::{BreakerAudit, BreakerEvent, RegimeAudit, RegimeChange, RegimeSnapshot};
use sqlx::PgPool;

use crate::database::DatabaseClient;

/// Repository for regime classification history.
#[derive(Clone)]
pub struct RegimeAuditRepository {
    pool: PgPool,
}

impl RegimeAuditRepository {
    #[must_use]
    pub fn new(client: &DatabaseClient) -> Self {
        Self {
            pool: client.pool(),
        }
    }
}

#[async_trait]
impl RegimeAudit for RegimeAuditRepository {
    async fn record_snapshot(&self, snapshot: &RegimeSnapshot) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO regime_snapshots
                (symbol, timeframe, regime, score, adx, ema_diff_pct, rsi, at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(&snapshot.symbol)
        .bind(snapshot.timeframe.as_str())
        .bind(snapshot.regime.as_str())
        .bind(snapshot.score)
        .bind(snapshot.adx)
        .bind(snapshot.ema_diff_pct)
        .bind(snapshot.rsi)
        .bind(snapshot.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_change(&self, change: &RegimeChange) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO regime_changes (symbol, timeframe, from_regime, to_regime, score, at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(&change.symbol)
        .bind(change.timeframe.as_str())
        .bind(change.from.as_str())
        .bind(change.to.as_str())
        .bind(change.score)
        .bind(change.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Repository for breaker trip/recovery history.
#[derive(Clone)]
pub struct BreakerAuditRepository {
    pool: PgPool,
}

impl BreakerAuditRepository {
    #[must_use]
    pub fn new(client: &DatabaseClient) -> Self {
        Self {
            pool: client.pool(),
        }
    }
}

#[async_trait]
impl BreakerAudit for BreakerAuditRepository {
    async fn record_event(&self, event: &BreakerEvent) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO breaker_events (direction, kind, streak, at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(event.direction.as_str())
        .bind(match event.kind {
            perp_core::BreakerEventKind::Tripped => "tripped",
            perp_core::BreakerEventKind::SentinelWin => "sentinel_win",
            perp_core::BreakerEventKind::SentinelLoss => "sentinel_loss",
            perp_core::BreakerEventKind::Recovered => "recovered",
        })
        .bind(i32::try_from(event.streak).unwrap_or(i32::MAX))
        .bind(event.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
