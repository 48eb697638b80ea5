//! Exit rule ladder.
//!
//! Pure evaluation over a snapshot of one tick, so every rule and the
//! priority ordering between rules is testable without a running monitor.
//! All loss/profit thresholds are unleveraged price-move percentages.

use perp_core::{CloseReason, Direction, Regime};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Rolling window of recent candle closes, oldest first.
#[derive(Debug, Clone, Default)]
pub struct CandleWindow {
    closes: Vec<f64>,
}

impl CandleWindow {
    const CAPACITY: usize = 3;

    #[must_use]
    pub fn from_closes(closes: &[f64]) -> Self {
        let start = closes.len().saturating_sub(Self::CAPACITY);
        Self {
            closes: closes[start..].to_vec(),
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.closes.len() >= Self::CAPACITY
    }

    /// Both recent steps flat or moving against the position.
    #[must_use]
    pub fn stagnant_or_worsening(&self, direction: Direction) -> bool {
        if !self.is_full() {
            return false;
        }
        let improving = |prev: f64, next: f64| match direction {
            Direction::Long => next > prev,
            Direction::Short => next < prev,
        };
        !improving(self.closes[0], self.closes[1]) && !improving(self.closes[1], self.closes[2])
    }

    /// A bounce toward profit that the latest candle gave back.
    #[must_use]
    pub fn failed_recovery(&self, direction: Direction) -> bool {
        if !self.is_full() {
            return false;
        }
        let improving = |prev: f64, next: f64| match direction {
            Direction::Long => next > prev,
            Direction::Short => next < prev,
        };
        improving(self.closes[0], self.closes[1]) && !improving(self.closes[1], self.closes[2])
    }
}

/// One hold-time checkpoint in the staged timeout table.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StagedCheckpoint {
    pub after_secs: i64,
    /// Acceptable loss at this age; closes when profit falls at or below it.
    pub loss_pct: f64,
}

/// Exit thresholds. Percentages are price moves, not leveraged returns.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExitRules {
    pub extreme_loss_pct: f64,
    pub smart_loss_min_hold_secs: i64,
    pub smart_major_loss_pct: f64,
    pub smart_minor_loss_pct: f64,
    pub trailing_min_hold_secs: i64,
    pub trailing_arm_pct: f64,
    pub trailing_retrace_pct: f64,
    pub reversal_min_profit_pct: f64,
    /// Checkpoints ordered by age ascending; the latest one passed applies.
    pub staged: Vec<StagedCheckpoint>,
    pub max_hold_secs: i64,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            extreme_loss_pct: 3.0,
            smart_loss_min_hold_secs: 1800,
            smart_major_loss_pct: 2.0,
            smart_minor_loss_pct: 1.0,
            trailing_min_hold_secs: 1800,
            trailing_arm_pct: 2.0,
            trailing_retrace_pct: 0.5,
            reversal_min_profit_pct: 0.5,
            staged: vec![
                StagedCheckpoint {
                    after_secs: 3600,
                    loss_pct: -2.5,
                },
                StagedCheckpoint {
                    after_secs: 7200,
                    loss_pct: -2.0,
                },
                StagedCheckpoint {
                    after_secs: 10800,
                    loss_pct: -1.5,
                },
                StagedCheckpoint {
                    after_secs: 14400,
                    loss_pct: -1.0,
                },
            ],
            max_hold_secs: 21600,
        }
    }
}

/// Everything one tick knows about a position.
#[derive(Debug, Clone)]
pub struct ExitSnapshot {
    pub direction: Direction,
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Signed price-move percentage, positive in profit.
    pub profit_pct: f64,
    pub peak_profit_pct: f64,
    pub held_secs: i64,
    pub m5: CandleWindow,
    pub m15: CandleWindow,
    /// Committed higher-timeframe regime, when fresh enough to use.
    pub regime: Option<Regime>,
}

impl ExitRules {
    /// Evaluates the ladder. First match wins.
    #[must_use]
    pub fn evaluate(&self, snapshot: &ExitSnapshot) -> Option<CloseReason> {
        // 1. Explicit stop-loss.
        if let Some(stop) = snapshot.stop_loss {
            let crossed = match snapshot.direction {
                Direction::Long => snapshot.price <= stop,
                Direction::Short => snapshot.price >= stop,
            };
            if crossed {
                return Some(CloseReason::StopLoss);
            }
        }

        // 2. Explicit take-profit.
        if let Some(target) = snapshot.take_profit {
            let crossed = match snapshot.direction {
                Direction::Long => snapshot.price >= target,
                Direction::Short => snapshot.price <= target,
            };
            if crossed {
                return Some(CloseReason::TakeProfit);
            }
        }

        // 3. Extreme loss, regardless of hold time.
        if snapshot.profit_pct <= -self.extreme_loss_pct {
            return Some(CloseReason::ExtremeLoss);
        }

        // 4. Smart loss, only after the minimum hold.
        if snapshot.held_secs >= self.smart_loss_min_hold_secs {
            if snapshot.profit_pct <= -self.smart_major_loss_pct
                && snapshot.m5.stagnant_or_worsening(snapshot.direction)
            {
                return Some(CloseReason::SmartLoss);
            }
            if snapshot.profit_pct <= -self.smart_minor_loss_pct
                && snapshot.m15.failed_recovery(snapshot.direction)
            {
                return Some(CloseReason::SmartLoss);
            }
        }

        // 5. Trailing stop once armed by peak profit.
        if snapshot.held_secs >= self.trailing_min_hold_secs
            && snapshot.peak_profit_pct >= self.trailing_arm_pct
            && snapshot.peak_profit_pct - snapshot.profit_pct >= self.trailing_retrace_pct
        {
            return Some(CloseReason::TrailingStop);
        }

        // 6. Regime flipped against a position with profit banked.
        if let Some(regime) = snapshot.regime {
            let against = match snapshot.direction {
                Direction::Long => regime.is_down(),
                Direction::Short => regime.is_up(),
            };
            if against && snapshot.profit_pct >= self.reversal_min_profit_pct {
                return Some(CloseReason::RegimeReversal);
            }
        }

        // 7. Staged timeout table: tolerance tightens with age.
        let mut threshold = None;
        for checkpoint in &self.staged {
            if snapshot.held_secs >= checkpoint.after_secs {
                threshold = Some(checkpoint.loss_pct);
            }
        }
        if let Some(loss_pct) = threshold {
            if snapshot.profit_pct <= loss_pct {
                return Some(CloseReason::StagedTimeout);
            }
        }

        // 8. Absolute max hold.
        if snapshot.held_secs >= self.max_hold_secs {
            return Some(CloseReason::MaxHold);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot() -> ExitSnapshot {
        ExitSnapshot {
            direction: Direction::Long,
            price: dec!(50000),
            stop_loss: None,
            take_profit: None,
            profit_pct: 0.0,
            peak_profit_pct: 0.0,
            held_secs: 0,
            m5: CandleWindow::default(),
            m15: CandleWindow::default(),
            regime: None,
        }
    }

    #[test]
    fn quiet_tick_matches_nothing() {
        assert_eq!(ExitRules::default().evaluate(&snapshot()), None);
    }

    #[test]
    fn stop_loss_crossed() {
        let mut snap = snapshot();
        snap.stop_loss = Some(dec!(49000));
        snap.price = dec!(48999);
        snap.profit_pct = -2.0;
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::StopLoss)
        );

        let mut snap = snapshot();
        snap.direction = Direction::Short;
        snap.stop_loss = Some(dec!(51000));
        snap.price = dec!(51001);
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::StopLoss)
        );
    }

    #[test]
    fn stop_loss_outranks_trailing_stop() {
        let mut snap = snapshot();
        snap.stop_loss = Some(dec!(50500));
        snap.price = dec!(50400);
        snap.held_secs = 3600;
        snap.peak_profit_pct = 3.0;
        snap.profit_pct = 0.8; // retrace 2.2 >= 0.5, trailing also satisfied
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::StopLoss)
        );
    }

    #[test]
    fn take_profit_crossed() {
        let mut snap = snapshot();
        snap.take_profit = Some(dec!(51000));
        snap.price = dec!(51050);
        snap.profit_pct = 2.1;
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::TakeProfit)
        );
    }

    #[test]
    fn extreme_loss_ignores_hold_time() {
        let mut snap = snapshot();
        snap.held_secs = 5;
        snap.profit_pct = -3.2;
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::ExtremeLoss)
        );
    }

    #[test]
    fn smart_loss_needs_minimum_hold() {
        let mut snap = snapshot();
        snap.profit_pct = -2.4;
        snap.m5 = CandleWindow::from_closes(&[50000.0, 49800.0, 49700.0]);
        snap.held_secs = 600;
        assert_eq!(ExitRules::default().evaluate(&snap), None);

        snap.held_secs = 1800;
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::SmartLoss)
        );
    }

    #[test]
    fn smart_loss_minor_needs_failed_recovery() {
        let mut snap = snapshot();
        snap.profit_pct = -1.2;
        snap.held_secs = 2000;
        // Bounce then give-back on the 15m window.
        snap.m15 = CandleWindow::from_closes(&[49500.0, 49800.0, 49600.0]);
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::SmartLoss)
        );

        // Sustained recovery keeps the position alive.
        snap.m15 = CandleWindow::from_closes(&[49500.0, 49800.0, 49900.0]);
        assert_eq!(ExitRules::default().evaluate(&snap), None);
    }

    #[test]
    fn trailing_stop_arms_at_peak_and_fires_on_retrace() {
        let mut snap = snapshot();
        snap.held_secs = 3600;
        snap.peak_profit_pct = 2.5;
        snap.profit_pct = 2.2;
        assert_eq!(ExitRules::default().evaluate(&snap), None);

        snap.profit_pct = 1.9;
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::TrailingStop)
        );

        // Peak never armed: no trailing exit however deep the retrace.
        snap.peak_profit_pct = 1.5;
        snap.profit_pct = 0.1;
        assert_eq!(ExitRules::default().evaluate(&snap), None);
    }

    #[test]
    fn regime_reversal_requires_banked_profit() {
        let mut snap = snapshot();
        snap.regime = Some(Regime::WeakDown);
        snap.profit_pct = 0.2;
        assert_eq!(ExitRules::default().evaluate(&snap), None);

        snap.profit_pct = 0.9;
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::RegimeReversal)
        );

        // Aligned regime never closes.
        snap.regime = Some(Regime::StrongUp);
        assert_eq!(ExitRules::default().evaluate(&snap), None);
    }

    #[test]
    fn staged_tolerance_tightens_with_age() {
        let mut snap = snapshot();
        snap.profit_pct = -1.2;

        snap.held_secs = 3700; // 1h bucket tolerates -2.5
        assert_eq!(ExitRules::default().evaluate(&snap), None);

        snap.held_secs = 14500; // 4h bucket tolerates only -1.0
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::StagedTimeout)
        );
    }

    #[test]
    fn max_hold_is_unconditional() {
        let mut snap = snapshot();
        snap.profit_pct = 1.4; // profitable and still closed
        snap.held_secs = 21600;
        assert_eq!(
            ExitRules::default().evaluate(&snap),
            Some(CloseReason::MaxHold)
        );
    }
}
