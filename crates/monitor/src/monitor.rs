//! The per-position monitor loop.
//!
//! Roughly 1 Hz: fetch a price, update the peak-profit marker, refresh the
//! slower candle/regime context on its own cadence, then run the exit rule
//! ladder. A failed tick is logged and skipped; only a closed (or vanished)
//! position ends the loop.

use crate::rules::{CandleWindow, ExitRules, ExitSnapshot};
use crate::supervisor::SentinelCloseHook;
use chrono::Utc;
use perp_core::{Candle, CandleSource, EngineError, PriceSource, Regime, Result, Timeframe};
use perp_ledger::{CloseOutcome, CloseRequest, Ledger};
use perp_regime::RegimeClassifier;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub tick_interval_ms: u64,
    /// Budget for one price fetch; a stalled feed skips the tick.
    pub price_timeout_ms: u64,
    /// Budget for one ledger write; a stalled store fails the tick instead
    /// of wedging the monitor.
    pub write_timeout_ms: u64,
    pub regime_refresh_secs: u64,
    /// Timeframe consulted for the reversal rule.
    pub regime_timeframe: Timeframe,
    pub rules: ExitRules,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            price_timeout_ms: 2000,
            write_timeout_ms: 3000,
            regime_refresh_secs: 60,
            regime_timeframe: Timeframe::H1,
            rules: ExitRules::default(),
        }
    }
}

pub(crate) struct MonitorDeps {
    pub ledger: Ledger,
    pub prices: Arc<dyn PriceSource>,
    pub candles: Arc<dyn CandleSource>,
    pub classifier: Option<Arc<RegimeClassifier>>,
    pub hook: Option<Arc<dyn SentinelCloseHook>>,
    pub config: MonitorConfig,
}

/// Rolling context refreshed on a slower cadence than the tick.
struct SlowContext {
    m5: CandleWindow,
    m15: CandleWindow,
    m5_refreshed: Option<Instant>,
    m15_refreshed: Option<Instant>,
    regime: Option<Regime>,
    regime_refreshed: Option<Instant>,
}

impl SlowContext {
    fn new() -> Self {
        Self {
            m5: CandleWindow::default(),
            m15: CandleWindow::default(),
            m5_refreshed: None,
            m15_refreshed: None,
            regime: None,
            regime_refreshed: None,
        }
    }

    fn due(last: Option<Instant>, every: Duration) -> bool {
        last.map_or(true, |at| at.elapsed() >= every)
    }
}

enum TickOutcome {
    Continue,
    Finished,
}

pub(crate) async fn run_monitor(
    deps: Arc<MonitorDeps>,
    position_id: i64,
    mut cancel: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_millis(deps.config.tick_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut slow = SlowContext::new();

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!(position_id, "monitor cancelled");
                    return;
                }
            }
            _ = interval.tick() => {
                match tick(&deps, position_id, &mut slow).await {
                    Ok(TickOutcome::Finished) => return,
                    Ok(TickOutcome::Continue) => {}
                    // Bulkhead: a bad tick never takes the monitor down.
                    Err(err) => {
                        warn!(position_id, error = %err, "monitor tick failed, continuing");
                    }
                }
            }
        }
    }
}

async fn tick(
    deps: &MonitorDeps,
    position_id: i64,
    slow: &mut SlowContext,
) -> Result<TickOutcome> {
    let Some(position) = deps.ledger.position(position_id).await? else {
        debug!(position_id, "position gone, monitor exiting");
        return Ok(TickOutcome::Finished);
    };
    if !position.is_open() {
        debug!(position_id, "position closed elsewhere, monitor exiting");
        return Ok(TickOutcome::Finished);
    }

    let price_budget = Duration::from_millis(deps.config.price_timeout_ms);
    let price = match tokio::time::timeout(price_budget, deps.prices.price(&position.symbol)).await
    {
        Ok(Ok(Some(price))) => price,
        Ok(Ok(None)) => {
            // No price is never a price of zero.
            debug!(position_id, symbol = %position.symbol, "no price, skipping tick");
            return Ok(TickOutcome::Continue);
        }
        Ok(Err(err)) => {
            warn!(position_id, error = %err, "price fetch failed, skipping tick");
            return Ok(TickOutcome::Continue);
        }
        Err(_) => {
            warn!(position_id, "price fetch timed out, skipping tick");
            return Ok(TickOutcome::Continue);
        }
    };

    let write_budget = Duration::from_millis(deps.config.write_timeout_ms);
    let profit_pct = position.profit_pct(price);
    let peak_profit_pct = if profit_pct > position.peak_profit_pct {
        deadline(
            write_budget,
            "peak profit write",
            deps.ledger.set_peak_profit(position.id, profit_pct),
        )
        .await?;
        profit_pct
    } else {
        position.peak_profit_pct
    };

    refresh_slow_context(deps, &position.symbol, slow).await;

    let held_secs = (Utc::now() - position.opened_at).num_seconds();
    let snapshot = ExitSnapshot {
        direction: position.direction,
        price,
        stop_loss: position.stop_loss,
        take_profit: position.take_profit,
        profit_pct,
        peak_profit_pct,
        held_secs,
        m5: slow.m5.clone(),
        m15: slow.m15.clone(),
        regime: slow.regime,
    };

    let Some(reason) = deps.config.rules.evaluate(&snapshot) else {
        return Ok(TickOutcome::Continue);
    };

    info!(
        position_id,
        symbol = %position.symbol,
        %reason,
        profit_pct,
        held_secs,
        "exit rule matched, closing"
    );
    let outcome = deadline(
        write_budget,
        "close",
        deps.ledger.close(CloseRequest {
            position_id,
            quantity: None,
            exit_price: Some(price),
            reason,
        }),
    )
    .await?;

    match outcome {
        CloseOutcome::Closed(closed) => {
            if position.is_virtual {
                if let Some(hook) = &deps.hook {
                    if let Err(err) = hook
                        .on_sentinel_close(
                            position.account_id,
                            position.direction,
                            closed.realized_pnl,
                        )
                        .await
                    {
                        warn!(position_id, error = %err, "sentinel close hook failed");
                    }
                }
            }
            Ok(TickOutcome::Finished)
        }
        // Another trigger won the race; either way this position is done.
        CloseOutcome::AlreadyClosed | CloseOutcome::NotFound => Ok(TickOutcome::Finished),
        CloseOutcome::PartiallyClosed(_) => Ok(TickOutcome::Continue),
    }
}

/// Caps a ledger call so an in-flight query on a dead connection cannot
/// wedge the tick; elapse surfaces as a storage error the bulkhead skips.
async fn deadline<T>(
    budget: Duration,
    what: &str,
    call: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::storage(format!("{what} timed out"))),
    }
}

async fn refresh_slow_context(deps: &MonitorDeps, symbol: &str, slow: &mut SlowContext) {
    let m5_cadence = Duration::from_secs(u64::from(Timeframe::M5.minutes()) * 60);
    if SlowContext::due(slow.m5_refreshed, m5_cadence) {
        match deps.candles.candles(symbol, Timeframe::M5, 3).await {
            Ok(candles) => {
                slow.m5 = window_from(&candles);
                slow.m5_refreshed = Some(Instant::now());
            }
            Err(err) => debug!(symbol, error = %err, "m5 candle refresh failed"),
        }
    }

    let m15_cadence = Duration::from_secs(u64::from(Timeframe::M15.minutes()) * 60);
    if SlowContext::due(slow.m15_refreshed, m15_cadence) {
        match deps.candles.candles(symbol, Timeframe::M15, 3).await {
            Ok(candles) => {
                slow.m15 = window_from(&candles);
                slow.m15_refreshed = Some(Instant::now());
            }
            Err(err) => debug!(symbol, error = %err, "m15 candle refresh failed"),
        }
    }

    if let Some(classifier) = &deps.classifier {
        let cadence = Duration::from_secs(deps.config.regime_refresh_secs);
        if SlowContext::due(slow.regime_refreshed, cadence) {
            match classifier
                .classify(symbol, deps.config.regime_timeframe)
                .await
            {
                Ok(classification) => {
                    slow.regime = Some(classification.regime);
                    slow.regime_refreshed = Some(Instant::now());
                }
                Err(err) => debug!(symbol, error = %err, "regime refresh failed"),
            }
        }
    }
}

fn window_from(candles: &[Candle]) -> CandleWindow {
    let closes: Vec<f64> = candles.iter().map(Candle::close_f64).collect();
    CandleWindow::from_closes(&closes)
}
