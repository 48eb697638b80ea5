//! Application configuration, merged from a TOML file and `PERP_`-prefixed
//! environment variables. Every section is validated before any component is
//! wired, so a bad value fails the process at startup instead of mid-run.

use crate::feed::MarketDataConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use perp_breaker::BreakerConfig;
use perp_core::{DatabaseConfig, EngineError};
use perp_executor::ExecutorConfig;
use perp_ledger::LedgerConfig;
use perp_monitor::{MonitorConfig, PriceFeedConfig};
use perp_regime::ClassifierConfig;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Where money-moving state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Postgres,
    /// Ephemeral paper store; nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Existing account to drive. A fresh one is created when absent.
    pub id: Option<i64>,
    pub starting_balance: Decimal,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            id: None,
            starting_balance: Decimal::new(10_000, 0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageKind,
    pub database: DatabaseConfig,
    pub account: AccountConfig,
    pub ledger: LedgerConfig,
    pub classifier: ClassifierConfig,
    pub breaker: BreakerConfig,
    pub monitor: MonitorConfig,
    pub executor: ExecutorConfig,
    pub price_feed: PriceFeedConfig,
    pub market_data: MarketDataConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::Postgres,
            database: DatabaseConfig::default(),
            account: AccountConfig::default(),
            ledger: LedgerConfig::default(),
            classifier: ClassifierConfig::default(),
            breaker: BreakerConfig::default(),
            monitor: MonitorConfig::default(),
            executor: ExecutorConfig::default(),
            price_feed: PriceFeedConfig::default(),
            market_data: MarketDataConfig::default(),
        }
    }
}

impl AppConfig {
    /// Rejects values that would make a component misbehave silently.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the offending field.
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        if self.account.starting_balance <= Decimal::ZERO {
            return Err(EngineError::Config(
                "account.starting_balance must be positive".to_string(),
            ));
        }
        if self.ledger.fee_rate < Decimal::ZERO || self.ledger.maintenance_rate < Decimal::ZERO {
            return Err(EngineError::Config(
                "ledger rates must not be negative".to_string(),
            ));
        }
        if self.classifier.ema_fast == 0 || self.classifier.ema_fast >= self.classifier.ema_slow {
            return Err(EngineError::Config(
                "classifier.ema_fast must be positive and below ema_slow".to_string(),
            ));
        }
        if self.classifier.hysteresis.confirmations == 0 {
            return Err(EngineError::Config(
                "classifier.hysteresis.confirmations must be at least 1".to_string(),
            ));
        }
        if self.classifier.hysteresis.enter_ranging > self.classifier.hysteresis.leave_ranging {
            return Err(EngineError::Config(
                "classifier.hysteresis.enter_ranging must not exceed leave_ranging".to_string(),
            ));
        }
        if self.breaker.loss_limit == 0 || self.breaker.win_target == 0 {
            return Err(EngineError::Config(
                "breaker streaks must be at least 1".to_string(),
            ));
        }
        if self.monitor.tick_interval_ms == 0 {
            return Err(EngineError::Config(
                "monitor.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.executor.ma_fast == 0 || self.executor.ma_fast >= self.executor.ma_slow {
            return Err(EngineError::Config(
                "executor.ma_fast must be positive and below ma_slow".to_string(),
            ));
        }
        if self.executor.rsi_oversold >= self.executor.rsi_overbought {
            return Err(EngineError::Config(
                "executor.rsi_oversold must be below rsi_overbought".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads and validates the application configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be parsed or a value fails
    /// validation.
    pub fn load(path: &str) -> Result<AppConfig> {
        let config: AppConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PERP_").split("__"))
            .extract()
            .context("loading configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn negative_balance_is_rejected() {
        let mut config = AppConfig::default();
        config.account.starting_balance = dec!(-1);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn inverted_moving_averages_are_rejected() {
        let mut config = AppConfig::default();
        config.executor.ma_fast = 30;
        config.executor.ma_slow = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let figment = Figment::new().merge(figment::providers::Toml::string(
            r#"
            storage = "memory"

            [account]
            starting_balance = "25000"
            "#,
        ));
        let config: AppConfig = figment.extract().unwrap();
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.account.starting_balance, dec!(25000));
        assert_eq!(config.breaker.loss_limit, 4);
    }

    #[test]
    fn single_field_section_override_merges_with_defaults() {
        let figment = Figment::new().merge(figment::providers::Toml::string(
            r#"
            [breaker]
            loss_limit = 6
            "#,
        ));
        let config: AppConfig = figment.extract().unwrap();
        assert_eq!(config.breaker.loss_limit, 6);
        // The untouched sibling field keeps its default.
        assert_eq!(config.breaker.win_target, 2);
        assert_eq!(config.monitor.tick_interval_ms, 1000);
    }
}
