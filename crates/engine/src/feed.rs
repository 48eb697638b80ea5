//! REST market data feed.
//!
//! Fetches OHLCV history from a klines endpoint speaking the Binance
//! futures wire format: a JSON array of rows, each row an array whose
//! first six cells are open time (ms), open, high, low, close, volume,
//! with prices as strings.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use perp_core::{Candle, CandleSource, Timeframe};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketDataConfig {
    /// Klines endpoint; queried as `{url}?symbol=&interval=&limit=`.
    pub klines_url: String,
    pub request_timeout_ms: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            klines_url: "https://fapi.binance.com/fapi/v1/klines".to_string(),
            request_timeout_ms: 3000,
        }
    }
}

pub struct RestCandleSource {
    http: reqwest::Client,
    config: MarketDataConfig,
}

impl RestCandleSource {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(config: MarketDataConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl CandleSource for RestCandleSource {
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>> {
        let response: Value = self
            .http
            .get(&self.config.klines_url)
            .query(&[
                ("symbol", symbol),
                ("interval", timeframe.as_str()),
                ("limit", &count.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let rows = response
            .as_array()
            .ok_or_else(|| anyhow!("unexpected klines payload for {symbol}"))?;
        rows.iter().map(parse_kline).collect()
    }
}

fn parse_kline(row: &Value) -> Result<Candle> {
    let cells = row.as_array().ok_or_else(|| anyhow!("kline row is not an array"))?;
    let open_time = cells
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("kline open time missing"))?;
    let timestamp = Utc
        .timestamp_millis_opt(open_time)
        .single()
        .ok_or_else(|| anyhow!("kline open time out of range: {open_time}"))?;
    Ok(Candle {
        timestamp,
        open: decimal_cell(cells, 1)?,
        high: decimal_cell(cells, 2)?,
        low: decimal_cell(cells, 3)?,
        close: decimal_cell(cells, 4)?,
        volume: decimal_cell(cells, 5)?,
    })
}

fn decimal_cell(cells: &[Value], index: usize) -> Result<Decimal> {
    let raw = cells
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("kline cell {index} missing or not a string"))?;
    Decimal::from_str(raw).map_err(|err| anyhow!("kline cell {index}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_a_wire_format_row() {
        let row: Value = serde_json::from_str(
            r#"[1700000000000, "50000.0", "50500.5", "49800.1", "50250.2", "1234.56",
                1700000059999, "62000000", 1500, "600.0", "30000000", "0"]"#,
        )
        .unwrap();
        let candle = parse_kline(&row).unwrap();
        assert_eq!(candle.open, dec!(50000.0));
        assert_eq!(candle.high, dec!(50500.5));
        assert_eq!(candle.low, dec!(49800.1));
        assert_eq!(candle.close, dec!(50250.2));
        assert_eq!(candle.volume, dec!(1234.56));
        assert_eq!(candle.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn rejects_a_malformed_row() {
        let row: Value = serde_json::from_str(r#"["not-a-timestamp"]"#).unwrap();
        assert!(parse_kline(&row).is_err());
    }
}
