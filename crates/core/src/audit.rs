//! Append-only audit sinks for regime and breaker history.

use crate::types::{Direction, Regime, Timeframe};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One classification result, persisted for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub regime: Regime,
    pub score: f64,
    pub adx: f64,
    pub ema_diff_pct: f64,
    pub rsi: f64,
    pub at: DateTime<Utc>,
}

/// A committed hysteresis transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeChange {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub from: Regime,
    pub to: Regime,
    pub score: f64,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait RegimeAudit: Send + Sync {
    async fn record_snapshot(&self, snapshot: &RegimeSnapshot) -> Result<()>;
    async fn record_change(&self, change: &RegimeChange) -> Result<()>;
}

/// Breaker lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerEventKind {
    /// Loss streak reached the limit; direction entered sentinel mode.
    Tripped,
    SentinelWin,
    SentinelLoss,
    /// Win streak reached the target; direction returned to normal.
    Recovered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub direction: Direction,
    pub kind: BreakerEventKind,
    /// Loss streak at trip time, or win streak for sentinel events.
    pub streak: u32,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait BreakerAudit: Send + Sync {
    async fn record_event(&self, event: &BreakerEvent) -> Result<()>;
}
