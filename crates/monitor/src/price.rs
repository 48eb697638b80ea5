//! Tiered price lookup: primary feed, then REST ticker, then the last
//! cached candle close. A tier that errors or has no answer falls through;
//! if every tier fails the result is `None` and the caller skips the tick.

use anyhow::Result;
use async_trait::async_trait;
use perp_core::{CandleSource, PriceSource, Timeframe};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriceFeedConfig {
    /// Ticker endpoint; queried as `{ticker_url}?symbol={symbol}`. Empty
    /// disables the REST tier.
    pub ticker_url: String,
    pub request_timeout_ms: u64,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            ticker_url: "https://fapi.binance.com/fapi/v1/ticker/price".to_string(),
            request_timeout_ms: 2000,
        }
    }
}

#[derive(Deserialize)]
struct TickerResponse {
    price: String,
}

/// Price source with REST and candle-cache fallbacks.
pub struct TieredPriceSource {
    primary: Option<Arc<dyn PriceSource>>,
    candles: Option<Arc<dyn CandleSource>>,
    http: reqwest::Client,
    config: PriceFeedConfig,
}

impl TieredPriceSource {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(
        primary: Option<Arc<dyn PriceSource>>,
        candles: Option<Arc<dyn CandleSource>>,
        config: PriceFeedConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            primary,
            candles,
            http,
            config,
        })
    }

    async fn rest_price(&self, symbol: &str) -> Result<Option<Decimal>> {
        if self.config.ticker_url.is_empty() {
            return Ok(None);
        }
        let response = self
            .http
            .get(&self.config.ticker_url)
            .query(&[("symbol", symbol)])
            .send()
            .await?
            .error_for_status()?
            .json::<TickerResponse>()
            .await?;
        Ok(Some(Decimal::from_str(&response.price)?))
    }

    async fn candle_price(&self, symbol: &str) -> Result<Option<Decimal>> {
        let Some(candles) = &self.candles else {
            return Ok(None);
        };
        let recent = candles.candles(symbol, Timeframe::M1, 1).await?;
        Ok(recent.last().map(|c| c.close))
    }
}

#[async_trait]
impl PriceSource for TieredPriceSource {
    async fn price(&self, symbol: &str) -> Result<Option<Decimal>> {
        if let Some(primary) = &self.primary {
            match primary.price(symbol).await {
                Ok(Some(price)) => return Ok(Some(price)),
                Ok(None) => debug!(symbol, "primary feed has no price, falling back"),
                Err(err) => warn!(symbol, error = %err, "primary feed failed, falling back"),
            }
        }

        match self.rest_price(symbol).await {
            Ok(Some(price)) => return Ok(Some(price)),
            Ok(None) => {}
            Err(err) => warn!(symbol, error = %err, "rest ticker failed, falling back"),
        }

        match self.candle_price(symbol).await {
            Ok(Some(price)) => {
                debug!(symbol, %price, "using cached candle close");
                Ok(Some(price))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!(symbol, error = %err, "candle fallback failed");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use perp_core::Candle;
    use rust_decimal_macros::dec;

    struct FixedPrice(Option<Decimal>);

    #[async_trait]
    impl PriceSource for FixedPrice {
        async fn price(&self, _symbol: &str) -> Result<Option<Decimal>> {
            Ok(self.0)
        }
    }

    struct FailingPrice;

    #[async_trait]
    impl PriceSource for FailingPrice {
        async fn price(&self, _symbol: &str) -> Result<Option<Decimal>> {
            anyhow::bail!("feed down")
        }
    }

    struct OneCandle(Decimal);

    #[async_trait]
    impl CandleSource for OneCandle {
        async fn candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _count: usize,
        ) -> Result<Vec<Candle>> {
            Ok(vec![Candle {
                timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                open: self.0,
                high: self.0,
                low: self.0,
                close: self.0,
                volume: Decimal::ONE,
            }])
        }
    }

    fn no_rest() -> PriceFeedConfig {
        PriceFeedConfig {
            ticker_url: String::new(),
            ..PriceFeedConfig::default()
        }
    }

    #[tokio::test]
    async fn primary_wins_when_available() {
        let source = TieredPriceSource::new(
            Some(Arc::new(FixedPrice(Some(dec!(50000))))),
            Some(Arc::new(OneCandle(dec!(49000)))),
            no_rest(),
        )
        .unwrap();
        assert_eq!(source.price("BTCUSDT").await.unwrap(), Some(dec!(50000)));
    }

    #[tokio::test]
    async fn failing_primary_falls_through_to_candles() {
        let source = TieredPriceSource::new(
            Some(Arc::new(FailingPrice)),
            Some(Arc::new(OneCandle(dec!(49000)))),
            no_rest(),
        )
        .unwrap();
        assert_eq!(source.price("BTCUSDT").await.unwrap(), Some(dec!(49000)));
    }

    #[tokio::test]
    async fn exhausted_tiers_yield_none_not_zero() {
        let source =
            TieredPriceSource::new(Some(Arc::new(FixedPrice(None))), None, no_rest()).unwrap();
        assert_eq!(source.price("BTCUSDT").await.unwrap(), None);
    }
}
