//! Debounced regime state machine.
//!
//! A raw classification only becomes the committed regime after clearing two
//! gates: a score margin (leaving ranging needs conviction, entering ranging
//! needs the score to have actually collapsed, a direct up/down flip needs a
//! large score swing) and a confirmation streak (the same candidate proposed
//! on K consecutive evaluations).

use perp_core::Regime;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HysteresisConfig {
    /// |score| required to leave `ranging`.
    pub leave_ranging: f64,
    /// |score| below which `ranging` may be entered.
    pub enter_ranging: f64,
    /// Score swing required for a direct up/down flip. Twice the leave
    /// margin by default.
    pub flip_delta: f64,
    /// Consecutive identical proposals required to commit.
    pub confirmations: u32,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            leave_ranging: 15.0,
            enter_ranging: 10.0,
            flip_delta: 30.0,
            confirmations: 4,
        }
    }
}

/// A committed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Regime,
    pub to: Regime,
}

/// Per-(symbol, timeframe) debounce state.
#[derive(Debug, Clone)]
pub struct Hysteresis {
    config: HysteresisConfig,
    committed: Regime,
    committed_score: f64,
    candidate: Option<Regime>,
    streak: u32,
}

impl Hysteresis {
    #[must_use]
    pub fn new(config: HysteresisConfig) -> Self {
        Self {
            config,
            committed: Regime::Ranging,
            committed_score: 0.0,
            candidate: None,
            streak: 0,
        }
    }

    #[must_use]
    pub fn committed(&self) -> Regime {
        self.committed
    }

    /// Feeds one evaluation. Returns the transition when one commits.
    pub fn observe(&mut self, proposal: Regime, score: f64) -> Option<Transition> {
        let proposal = self.gate(proposal, score);

        if proposal == self.committed {
            self.candidate = None;
            self.streak = 0;
            return None;
        }

        if self.candidate == Some(proposal) {
            self.streak += 1;
        } else {
            self.candidate = Some(proposal);
            self.streak = 1;
        }

        if self.streak >= self.config.confirmations {
            let from = self.committed;
            self.committed = proposal;
            self.committed_score = score;
            self.candidate = None;
            self.streak = 0;
            return Some(Transition { from, to: proposal });
        }
        None
    }

    /// Resets to `ranging` with no pending candidate.
    pub fn clear(&mut self) {
        self.committed = Regime::Ranging;
        self.committed_score = 0.0;
        self.candidate = None;
        self.streak = 0;
    }

    fn gate(&self, proposal: Regime, score: f64) -> Regime {
        if self.committed.is_ranging() && !proposal.is_ranging() {
            if score.abs() <= self.config.leave_ranging {
                return self.committed;
            }
        } else if !self.committed.is_ranging() && proposal.is_ranging() {
            if score.abs() >= self.config.enter_ranging {
                return self.committed;
            }
        } else if i32::from(self.committed.sign()) * i32::from(proposal.sign()) == -1
            && (score - self.committed_score).abs() <= self.config.flip_delta
        {
            return self.committed;
        }
        proposal
    }
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self::new(HysteresisConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_strong_sample_does_not_leave_ranging() {
        let mut hysteresis = Hysteresis::default();
        assert!(hysteresis.observe(Regime::StrongUp, 40.0).is_none());
        assert_eq!(hysteresis.committed(), Regime::Ranging);
    }

    #[test]
    fn four_consecutive_samples_commit() {
        let mut hysteresis = Hysteresis::default();
        for _ in 0..3 {
            assert!(hysteresis.observe(Regime::StrongUp, 40.0).is_none());
        }
        let transition = hysteresis.observe(Regime::StrongUp, 40.0);
        assert_eq!(
            transition,
            Some(Transition {
                from: Regime::Ranging,
                to: Regime::StrongUp
            })
        );
        assert_eq!(hysteresis.committed(), Regime::StrongUp);
    }

    #[test]
    fn differing_proposal_resets_the_streak() {
        let mut hysteresis = Hysteresis::default();
        for _ in 0..3 {
            hysteresis.observe(Regime::StrongUp, 40.0);
        }
        // A weak-up interloper restarts the count.
        hysteresis.observe(Regime::WeakUp, 20.0);
        for _ in 0..3 {
            assert!(hysteresis.observe(Regime::StrongUp, 40.0).is_none());
        }
        assert!(hysteresis.observe(Regime::StrongUp, 40.0).is_some());
    }

    #[test]
    fn weak_score_cannot_leave_ranging_even_with_streak() {
        let mut hysteresis = Hysteresis::default();
        for _ in 0..10 {
            assert!(hysteresis.observe(Regime::WeakUp, 12.0).is_none());
        }
        assert_eq!(hysteresis.committed(), Regime::Ranging);
    }

    #[test]
    fn entering_ranging_requires_a_collapsed_score() {
        let mut hysteresis = Hysteresis::default();
        for _ in 0..4 {
            hysteresis.observe(Regime::StrongUp, 40.0);
        }
        // Score still elevated: the ranging proposal is gated away.
        for _ in 0..10 {
            assert!(hysteresis.observe(Regime::Ranging, 12.0).is_none());
        }
        assert_eq!(hysteresis.committed(), Regime::StrongUp);

        for _ in 0..4 {
            hysteresis.observe(Regime::Ranging, 5.0);
        }
        assert_eq!(hysteresis.committed(), Regime::Ranging);
    }

    #[test]
    fn direct_flip_needs_a_large_score_swing() {
        let mut hysteresis = Hysteresis::default();
        for _ in 0..4 {
            hysteresis.observe(Regime::WeakUp, 20.0);
        }
        // Delta 25 < 30: gated.
        for _ in 0..10 {
            assert!(hysteresis.observe(Regime::WeakDown, -5.0).is_none());
        }
        assert_eq!(hysteresis.committed(), Regime::WeakUp);

        // Delta 40 > 30: flips after the streak.
        for _ in 0..4 {
            hysteresis.observe(Regime::WeakDown, -20.0);
        }
        assert_eq!(hysteresis.committed(), Regime::WeakDown);
    }

    #[test]
    fn clear_resets_to_ranging() {
        let mut hysteresis = Hysteresis::default();
        for _ in 0..4 {
            hysteresis.observe(Regime::StrongDown, -40.0);
        }
        assert_eq!(hysteresis.committed(), Regime::StrongDown);
        hysteresis.clear();
        assert_eq!(hysteresis.committed(), Regime::Ranging);
    }
}
