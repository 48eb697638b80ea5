//! Outcome-gated admission control.
//!
//! Instead of gating on error rate, the breaker gates on trailing realized
//! P&L per trade direction: a streak of real losses trips the direction into
//! sentinel mode, where only virtual probe orders are allowed, and a streak
//! of probe wins recovers it. The loss streak is always derived from trade
//! history; only the sentinel-mode flag and its win streak live in memory.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use perp_core::{
    BreakerAudit, BreakerEvent, BreakerEventKind, CloseReason, Direction, EngineError, OrderKind,
    Result, Trade,
};
use perp_ledger::{CloseRequest, Ledger, OpenOutcome, OpenRequest};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive real losses that trip a direction into sentinel mode.
    pub loss_limit: u32,
    /// Consecutive sentinel wins that recover a direction.
    pub win_target: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            loss_limit: 4,
            win_target: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Normal,
    Sentinel,
}

#[derive(Debug, Clone)]
struct DirectionState {
    status: BreakerStatus,
    sentinel_wins: u32,
    entered_at: Option<DateTime<Utc>>,
}

impl Default for DirectionState {
    fn default() -> Self {
        Self {
            status: BreakerStatus::Normal,
            sentinel_wins: 0,
            entered_at: None,
        }
    }
}

/// Admission verdict for one direction.
#[derive(Debug, Clone)]
pub struct Admission {
    pub allowed: bool,
    /// Denial reason when not allowed.
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DirectionSnapshot {
    pub direction: Direction,
    pub status: BreakerStatus,
    pub loss_streak: u32,
    pub sentinel_wins: u32,
    pub entered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub long: DirectionSnapshot,
    pub short: DirectionSnapshot,
}

/// Walks closed trades newest-first, counting losses until the first win.
/// Breakeven closes are neutral: skipped without breaking the streak.
#[must_use]
pub fn consecutive_losses(closes_newest_first: &[Trade]) -> u32 {
    let mut streak = 0;
    for trade in closes_newest_first {
        match trade.realized_pnl {
            Some(pnl) if pnl > Decimal::ZERO => break,
            Some(pnl) if pnl.is_zero() => continue,
            Some(_) => streak += 1,
            None => break,
        }
    }
    streak
}

/// Per-direction breaker over the ledger's trade history.
pub struct AdmissionController {
    ledger: Ledger,
    audit: Option<Arc<dyn BreakerAudit>>,
    config: BreakerConfig,
    states: RwLock<HashMap<Direction, DirectionState>>,
}

impl AdmissionController {
    pub fn new(ledger: Ledger, audit: Option<Arc<dyn BreakerAudit>>, config: BreakerConfig) -> Self {
        Self {
            ledger,
            audit,
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a real entry in this direction is currently admitted.
    ///
    /// Re-derives the loss streak from trade history on every call, so a
    /// fresh run of losses trips the breaker here, not on close.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when trade history cannot be read.
    pub async fn is_admitted(&self, account_id: i64, direction: Direction) -> Result<Admission> {
        if self.state_of(direction).status == BreakerStatus::Sentinel {
            return Ok(Admission {
                allowed: false,
                reason: Some(format!(
                    "{direction} entries suspended pending sentinel recovery"
                )),
            });
        }

        let closes = self
            .ledger
            .store()
            .recent_real_closes(account_id, direction, self.config.loss_limit as usize)
            .await?;
        let streak = consecutive_losses(&closes);
        if streak >= self.config.loss_limit {
            self.trip(direction, streak).await;
            return Ok(Admission {
                allowed: false,
                reason: Some(format!(
                    "{streak} consecutive {direction} losses, entries suspended"
                )),
            });
        }

        Ok(Admission {
            allowed: true,
            reason: None,
        })
    }

    /// Opens a virtual probe position. Only meaningful while the direction
    /// is in sentinel mode.
    ///
    /// # Errors
    ///
    /// `AdmissionDenied` when the direction is not in sentinel mode, plus
    /// any ledger open failure.
    pub async fn create_sentinel_order(&self, request: OpenRequest) -> Result<OpenOutcome> {
        if self.state_of(request.direction).status != BreakerStatus::Sentinel {
            return Err(EngineError::AdmissionDenied {
                direction: request.direction,
                reason: "sentinel orders are only created while tripped".to_string(),
            });
        }
        let request = OpenRequest {
            kind: OrderKind::Market,
            limit_price: None,
            is_virtual: true,
            ..request
        };
        self.ledger.open(request).await
    }

    /// Feeds a closed sentinel trade's outcome into the recovery streak.
    /// A win extends the streak; reaching the target recovers the direction
    /// and clears any still-open sentinel positions. A loss resets the
    /// streak without leaving sentinel mode. Breakeven carries no signal
    /// and leaves the streak untouched.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when sentinel cleanup cannot read open positions.
    pub async fn record_sentinel_close(
        &self,
        account_id: i64,
        direction: Direction,
        realized_pnl: Decimal,
    ) -> Result<()> {
        if realized_pnl.is_zero() {
            return Ok(());
        }
        let won = realized_pnl > Decimal::ZERO;
        let (recovered, wins) = {
            let mut states = self.states.write();
            let state = states.entry(direction).or_default();
            if state.status != BreakerStatus::Sentinel {
                return Ok(());
            }
            if won {
                state.sentinel_wins += 1;
                if state.sentinel_wins >= self.config.win_target {
                    let wins = state.sentinel_wins;
                    state.status = BreakerStatus::Normal;
                    state.sentinel_wins = 0;
                    state.entered_at = None;
                    (true, wins)
                } else {
                    (false, state.sentinel_wins)
                }
            } else {
                state.sentinel_wins = 0;
                (false, 0)
            }
        };

        if won {
            self.record_event(direction, BreakerEventKind::SentinelWin, wins)
                .await;
        } else {
            self.record_event(direction, BreakerEventKind::SentinelLoss, 0)
                .await;
        }

        if recovered {
            info!(%direction, "breaker recovered, real entries re-admitted");
            self.record_event(direction, BreakerEventKind::Recovered, wins)
                .await;
            self.cleanup_sentinels(account_id, direction).await?;
        }
        Ok(())
    }

    /// Per-direction state snapshot for the status surface.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when trade history cannot be read.
    pub async fn status(&self, account_id: i64) -> Result<BreakerSnapshot> {
        Ok(BreakerSnapshot {
            long: self.direction_snapshot(account_id, Direction::Long).await?,
            short: self.direction_snapshot(account_id, Direction::Short).await?,
        })
    }

    async fn direction_snapshot(
        &self,
        account_id: i64,
        direction: Direction,
    ) -> Result<DirectionSnapshot> {
        let closes = self
            .ledger
            .store()
            .recent_real_closes(account_id, direction, self.config.loss_limit as usize)
            .await?;
        let state = self.state_of(direction);
        Ok(DirectionSnapshot {
            direction,
            status: state.status,
            loss_streak: consecutive_losses(&closes),
            sentinel_wins: state.sentinel_wins,
            entered_at: state.entered_at,
        })
    }

    fn state_of(&self, direction: Direction) -> DirectionState {
        self.states
            .read()
            .get(&direction)
            .cloned()
            .unwrap_or_default()
    }

    async fn trip(&self, direction: Direction, streak: u32) {
        {
            let mut states = self.states.write();
            let state = states.entry(direction).or_default();
            if state.status == BreakerStatus::Sentinel {
                return;
            }
            state.status = BreakerStatus::Sentinel;
            state.sentinel_wins = 0;
            state.entered_at = Some(Utc::now());
        }
        warn!(%direction, streak, "breaker tripped, real entries suspended");
        self.record_event(direction, BreakerEventKind::Tripped, streak)
            .await;
    }

    async fn cleanup_sentinels(&self, account_id: i64, direction: Direction) -> Result<()> {
        let open = self
            .ledger
            .store()
            .open_virtual_positions(account_id, direction)
            .await?;
        for position in open {
            let result = self
                .ledger
                .close(CloseRequest {
                    position_id: position.id,
                    quantity: None,
                    exit_price: None,
                    reason: CloseReason::SentinelCleanup,
                })
                .await;
            if let Err(err) = result {
                warn!(
                    position_id = position.id,
                    error = %err,
                    "failed to clean up sentinel position"
                );
            }
        }
        Ok(())
    }

    async fn record_event(&self, direction: Direction, kind: BreakerEventKind, streak: u32) {
        if let Some(audit) = &self.audit {
            let event = BreakerEvent {
                direction,
                kind,
                streak,
                at: Utc::now(),
            };
            if let Err(err) = audit.record_event(&event).await {
                warn!(%direction, error = %err, "failed to record breaker event");
            }
        }
    }
}
