//! Boundary traits for out-of-scope collaborators (market data feeds).

use crate::types::{Candle, Timeframe};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Real-time price lookup. `Ok(None)` means the source has no price right
/// now; callers must treat that as "skip", never as a zero price.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn price(&self, symbol: &str) -> Result<Option<Decimal>>;
}

/// Historical candle store, most recent candle last.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>>;
}
