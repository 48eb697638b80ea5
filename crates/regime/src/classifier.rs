//! Trend/ranging classification per (symbol, timeframe).
//!
//! A raw score blends EMA separation, ADX trend strength, an RSI
//! mean-reversion adjustment, and a trend-persistence bonus. The raw bucket
//! is corrected against a higher timeframe and against the reference asset,
//! then debounced through the per-key hysteresis machine before anything is
//! reported as the committed regime.

use crate::hysteresis::{Hysteresis, HysteresisConfig};
use crate::indicators;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use perp_core::{Candle, CandleSource, Regime, RegimeAudit, RegimeChange, RegimeSnapshot, Timeframe};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub adx_period: usize,
    pub rsi_period: usize,
    /// Candles fetched per classification.
    pub candle_count: usize,
    /// |EMA diff %| and ADX needed for a strong trend bucket.
    pub strong_diff_pct: f64,
    pub strong_adx: f64,
    /// |EMA diff %| or ADX needed for a weak trend bucket.
    pub weak_diff_pct: f64,
    pub weak_adx: f64,
    /// Symbol whose own score corrects everything else.
    pub reference_symbol: String,
    pub reference_refresh_secs: i64,
    pub hysteresis: HysteresisConfig,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ema_fast: 9,
            ema_slow: 26,
            adx_period: 14,
            rsi_period: 14,
            candle_count: 100,
            strong_diff_pct: 1.5,
            strong_adx: 40.0,
            weak_diff_pct: 0.8,
            weak_adx: 25.0,
            reference_symbol: "BTCUSDT".to_string(),
            reference_refresh_secs: 300,
            hysteresis: HysteresisConfig::default(),
        }
    }
}

/// One classification result.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Committed (debounced) regime.
    pub regime: Regime,
    /// This evaluation's proposal before hysteresis.
    pub proposal: Regime,
    pub score: f64,
    pub adx: f64,
    pub ema_diff_pct: f64,
    pub rsi: f64,
    pub persistence_bars: i32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSignal {
    pub score: f64,
    pub adx: f64,
    pub ema_diff_pct: f64,
    pub rsi: f64,
    pub persistence_bars: i32,
    pub bucket: Regime,
}

impl RawSignal {
    fn sign(&self) -> i8 {
        self.bucket.sign()
    }
}

/// Multi-timeframe classifier with per-key hysteresis.
pub struct RegimeClassifier {
    candles: Arc<dyn CandleSource>,
    audit: Option<Arc<dyn RegimeAudit>>,
    config: ClassifierConfig,
    hysteresis: Mutex<HashMap<(String, Timeframe), Hysteresis>>,
    reference_cache: Mutex<Option<(DateTime<Utc>, f64)>>,
}

impl RegimeClassifier {
    pub fn new(
        candles: Arc<dyn CandleSource>,
        audit: Option<Arc<dyn RegimeAudit>>,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            candles,
            audit,
            config,
            hysteresis: Mutex::new(HashMap::new()),
            reference_cache: Mutex::new(None),
        }
    }

    /// Classifies a symbol at a timeframe.
    ///
    /// Insufficient history classifies as ranging with score zero rather
    /// than failing; entry gates treat ranging as "no trend conviction".
    ///
    /// # Errors
    ///
    /// Returns an error when the candle source itself fails.
    pub async fn classify(&self, symbol: &str, timeframe: Timeframe) -> Result<Classification> {
        let raw = self.evaluate_symbol(symbol, timeframe).await?;
        let (mut proposal, mut score, raw) = match raw {
            Some(raw) => (raw.bucket, raw.score, raw),
            None => {
                debug!(symbol, %timeframe, "insufficient history, proposing ranging");
                (
                    Regime::Ranging,
                    0.0,
                    RawSignal {
                        score: 0.0,
                        adx: 0.0,
                        ema_diff_pct: 0.0,
                        rsi: 50.0,
                        persistence_bars: 0,
                        bucket: Regime::Ranging,
                    },
                )
            }
        };

        // Higher-timeframe correction.
        if let Some(higher) = higher_timeframe(timeframe) {
            if let Some(higher_raw) = self.evaluate_symbol(symbol, higher).await? {
                let (p, s) = align(proposal, score, sign_of(higher_raw.score));
                proposal = p;
                score = s;
            }
        }

        // Reference-asset correction.
        if symbol != self.config.reference_symbol {
            if let Some(reference_score) = self.reference_score().await? {
                let (p, s) = align(proposal, score, sign_of(reference_score));
                proposal = p;
                score = s;
            }
        }

        let (committed, transition) = {
            let mut map = self.hysteresis.lock();
            let state = map
                .entry((symbol.to_string(), timeframe))
                .or_insert_with(|| Hysteresis::new(self.config.hysteresis.clone()));
            let transition = state.observe(proposal, score);
            (state.committed(), transition)
        };

        let now = Utc::now();
        if let Some(transition) = transition {
            info!(
                symbol,
                %timeframe,
                from = %transition.from,
                to = %transition.to,
                score,
                "regime transition committed"
            );
            if let Some(audit) = &self.audit {
                let change = RegimeChange {
                    symbol: symbol.to_string(),
                    timeframe,
                    from: transition.from,
                    to: transition.to,
                    score,
                    at: now,
                };
                if let Err(err) = audit.record_change(&change).await {
                    warn!(symbol, error = %err, "failed to record regime change");
                }
            }
        }

        if let Some(audit) = &self.audit {
            let snapshot = RegimeSnapshot {
                symbol: symbol.to_string(),
                timeframe,
                regime: committed,
                score,
                adx: raw.adx,
                ema_diff_pct: raw.ema_diff_pct,
                rsi: raw.rsi,
                at: now,
            };
            if let Err(err) = audit.record_snapshot(&snapshot).await {
                warn!(symbol, error = %err, "failed to record regime snapshot");
            }
        }

        Ok(Classification {
            regime: committed,
            proposal,
            score,
            adx: raw.adx,
            ema_diff_pct: raw.ema_diff_pct,
            rsi: raw.rsi,
            persistence_bars: raw.persistence_bars,
        })
    }

    /// Drops the hysteresis state for a key, resetting it to ranging.
    pub fn clear(&self, symbol: &str, timeframe: Timeframe) {
        self.hysteresis
            .lock()
            .remove(&(symbol.to_string(), timeframe));
    }

    async fn evaluate_symbol(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<RawSignal>> {
        let candles = self
            .candles
            .candles(symbol, timeframe, self.config.candle_count)
            .await?;
        Ok(evaluate(&candles, &self.config))
    }

    /// The reference symbol's own H1 score, refreshed at most every
    /// `reference_refresh_secs`.
    async fn reference_score(&self) -> Result<Option<f64>> {
        let max_age = Duration::seconds(self.config.reference_refresh_secs);
        if let Some((at, score)) = *self.reference_cache.lock() {
            if Utc::now() - at < max_age {
                return Ok(Some(score));
            }
        }
        let raw = self
            .evaluate_symbol(&self.config.reference_symbol.clone(), Timeframe::H1)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        *self.reference_cache.lock() = Some((Utc::now(), raw.score));
        Ok(Some(raw.score))
    }
}

fn sign_of(score: f64) -> i8 {
    if score > 0.0 {
        1
    } else if score < 0.0 {
        -1
    } else {
        0
    }
}

/// Demotes a counter-trend proposal to ranging (score x0.3), amplifies an
/// aligned one (score x1.2).
fn align(proposal: Regime, score: f64, other_sign: i8) -> (Regime, f64) {
    let sign = proposal.sign();
    if sign == 0 || other_sign == 0 {
        return (proposal, score);
    }
    if i32::from(sign) * i32::from(other_sign) < 0 {
        (Regime::Ranging, score * 0.3)
    } else {
        (proposal, score * 1.2)
    }
}

fn higher_timeframe(timeframe: Timeframe) -> Option<Timeframe> {
    match timeframe {
        Timeframe::M1 => Some(Timeframe::M15),
        Timeframe::M5 | Timeframe::M15 => Some(Timeframe::H1),
        Timeframe::H1 => Some(Timeframe::H4),
        Timeframe::H4 => None,
    }
}

pub(crate) fn evaluate(candles: &[Candle], config: &ClassifierConfig) -> Option<RawSignal> {
    if candles.len() < config.ema_slow.max(2 * config.adx_period) + 1 {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(Candle::close_f64).collect();
    let highs: Vec<f64> = candles.iter().map(Candle::high_f64).collect();
    let lows: Vec<f64> = candles.iter().map(Candle::low_f64).collect();

    let fast = indicators::ema(&closes, config.ema_fast);
    let slow = indicators::ema(&closes, config.ema_slow);
    let adx = indicators::adx(&highs, &lows, &closes, config.adx_period);
    let rsi = indicators::rsi(&closes, config.rsi_period);

    let last = closes.len() - 1;
    let (fast_last, slow_last, adx_last, rsi_last) = (fast[last], slow[last], adx[last], rsi[last]);
    if fast_last.is_nan() || slow_last.is_nan() || adx_last.is_nan() || rsi_last.is_nan() {
        return None;
    }
    if slow_last == 0.0 {
        return None;
    }

    let ema_diff_pct = (fast_last - slow_last) / slow_last * 100.0;
    let persistence_bars = indicators::trailing_ordering_bars(&fast, &slow);

    // ADX scales conviction: flat markets halve the EMA contribution, strong
    // trends double it.
    let adx_multiplier = (0.5 + adx_last / 50.0).clamp(0.5, 2.0);
    let persistence_bonus =
        f64::from(persistence_bars.signum()) * f64::from(persistence_bars.abs().min(20)) * 0.25;
    let score =
        ema_diff_pct * 20.0 * adx_multiplier + (50.0 - rsi_last) * 0.2 + persistence_bonus;

    let bucket = bucket(ema_diff_pct, adx_last, config);

    Some(RawSignal {
        score,
        adx: adx_last,
        ema_diff_pct,
        rsi: rsi_last,
        persistence_bars,
        bucket,
    })
}

fn bucket(ema_diff_pct: f64, adx: f64, config: &ClassifierConfig) -> Regime {
    let up = ema_diff_pct > 0.0;
    if ema_diff_pct.abs() >= config.strong_diff_pct && adx >= config.strong_adx {
        if up {
            Regime::StrongUp
        } else {
            Regime::StrongDown
        }
    } else if ema_diff_pct.abs() >= config.weak_diff_pct || adx >= config.weak_adx {
        if up {
            Regime::WeakUp
        } else {
            Regime::WeakDown
        }
    } else {
        Regime::Ranging
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn make_candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let close_dec = Decimal::try_from(close).unwrap();
                Candle {
                    timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap(),
                    open: close_dec,
                    high: Decimal::try_from(close * 1.002).unwrap(),
                    low: Decimal::try_from(close * 0.998).unwrap(),
                    close: close_dec,
                    volume: Decimal::ONE,
                }
            })
            .collect()
    }

    fn trending(up: bool, n: usize) -> Vec<Candle> {
        let closes: Vec<f64> = (0..n)
            .map(|i| {
                let step = i as f64 * 0.7;
                if up {
                    100.0 + step
                } else {
                    200.0 - step
                }
            })
            .collect();
        make_candles(&closes)
    }

    #[test]
    fn strong_uptrend_scores_positive() {
        let candles = trending(true, 100);
        let raw = evaluate(&candles, &ClassifierConfig::default()).unwrap();
        assert!(raw.score > 0.0, "score {} should be positive", raw.score);
        assert!(raw.bucket.is_up(), "bucket {:?}", raw.bucket);
        assert!(raw.persistence_bars > 0);
    }

    #[test]
    fn strong_downtrend_scores_negative() {
        let candles = trending(false, 100);
        let raw = evaluate(&candles, &ClassifierConfig::default()).unwrap();
        assert!(raw.score < 0.0);
        assert!(raw.bucket.is_down());
        assert!(raw.persistence_bars < 0);
    }

    #[test]
    fn flat_series_ranges() {
        let closes: Vec<f64> = (0..100)
            .map(|i| 100.0 + if i % 2 == 0 { 0.01 } else { -0.01 })
            .collect();
        let candles = make_candles(&closes);
        let raw = evaluate(&candles, &ClassifierConfig::default()).unwrap();
        assert!(raw.bucket.is_ranging(), "bucket {:?}", raw.bucket);
    }

    #[test]
    fn too_little_history_yields_none() {
        let candles = trending(true, 10);
        assert!(evaluate(&candles, &ClassifierConfig::default()).is_none());
    }

    #[test]
    fn misaligned_proposal_is_demoted() {
        let (regime, score) = align(Regime::WeakUp, 20.0, -1);
        assert_eq!(regime, Regime::Ranging);
        assert!((score - 6.0).abs() < 1e-9);
    }

    #[test]
    fn aligned_proposal_is_amplified() {
        let (regime, score) = align(Regime::WeakUp, 20.0, 1);
        assert_eq!(regime, Regime::WeakUp);
        assert!((score - 24.0).abs() < 1e-9);
    }

    #[test]
    fn ranging_proposal_passes_through_alignment() {
        let (regime, score) = align(Regime::Ranging, 5.0, 1);
        assert_eq!(regime, Regime::Ranging);
        assert!((score - 5.0).abs() < 1e-9);
    }

    #[test]
    fn higher_timeframe_ladder() {
        assert_eq!(higher_timeframe(Timeframe::M5), Some(Timeframe::H1));
        assert_eq!(higher_timeframe(Timeframe::H1), Some(Timeframe::H4));
        assert_eq!(higher_timeframe(Timeframe::H4), None);
    }

    struct StaticCandles {
        by_timeframe: HashMap<Timeframe, Vec<Candle>>,
    }

    #[async_trait::async_trait]
    impl CandleSource for StaticCandles {
        async fn candles(
            &self,
            _symbol: &str,
            timeframe: Timeframe,
            _count: usize,
        ) -> Result<Vec<Candle>> {
            Ok(self.by_timeframe.get(&timeframe).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn classify_commits_only_after_the_confirmation_streak() {
        let mut by_timeframe = HashMap::new();
        by_timeframe.insert(Timeframe::M5, trending(true, 100));
        by_timeframe.insert(Timeframe::H1, trending(true, 100));
        let classifier = RegimeClassifier::new(
            Arc::new(StaticCandles { by_timeframe }),
            None,
            ClassifierConfig {
                // The test symbol is the reference, so no reference gating.
                reference_symbol: "TESTUSDT".to_string(),
                ..ClassifierConfig::default()
            },
        );

        for _ in 0..3 {
            let result = classifier.classify("TESTUSDT", Timeframe::M5).await.unwrap();
            assert_eq!(result.regime, Regime::Ranging);
            assert!(result.proposal.is_up());
        }
        let result = classifier.classify("TESTUSDT", Timeframe::M5).await.unwrap();
        assert!(result.regime.is_up(), "regime {:?}", result.regime);
    }

    #[tokio::test]
    async fn counter_trend_higher_timeframe_demotes_to_ranging() {
        let mut by_timeframe = HashMap::new();
        by_timeframe.insert(Timeframe::M5, trending(true, 100));
        by_timeframe.insert(Timeframe::H1, trending(false, 100));
        let classifier = RegimeClassifier::new(
            Arc::new(StaticCandles { by_timeframe }),
            None,
            ClassifierConfig {
                reference_symbol: "TESTUSDT".to_string(),
                ..ClassifierConfig::default()
            },
        );

        for _ in 0..8 {
            let result = classifier.classify("TESTUSDT", Timeframe::M5).await.unwrap();
            assert_eq!(result.proposal, Regime::Ranging);
            assert_eq!(result.regime, Regime::Ranging);
        }
    }
}
