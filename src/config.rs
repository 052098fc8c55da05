use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use ethers_core::types::Address;
use serde::Deserialize;

use crate::retry::RetryPolicy;

pub const DEAD_ADDRESS: &str = "0x000000000000000000000000000000000000dEaD";
pub const UNI_TOKEN_ADDRESS: &str = "0x1f9840a85d5aF5bf1D1762F925BDADdC4201F984";
pub const START_DATE: &str = "2025-12-29";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub explorer_api_url: String,
    pub price_api_url: String,
    pub price_coin_id: String,
    pub token_address: String,
    pub dead_address: String,
    pub start_date: NaiveDate,
    pub token_decimals: u32,
    pub refresh_interval_secs: u64,
    pub page_delay_ms: u64,
    pub historical_price_delay_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./data/burns.db".to_string(),
            explorer_api_url: "https://eth.blockscout.com/api/v2".to_string(),
            price_api_url: "https://api.coingecko.com/api/v3".to_string(),
            price_coin_id: "uniswap".to_string(),
            token_address: UNI_TOKEN_ADDRESS.to_string(),
            dead_address: DEAD_ADDRESS.to_string(),
            start_date: NaiveDate::from_ymd_opt(2025, 12, 29).unwrap_or(NaiveDate::MIN),
            token_decimals: 18,
            refresh_interval_secs: 300,
            page_delay_ms: 200,
            historical_price_delay_ms: 1000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_multiplier: 2.0,
            http_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Reads `.env`, then `BURNWATCH_*` environment variables over the defaults.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        let config: Config = ::config::Config::builder()
            .set_default("database_url", defaults.database_url)?
            .set_default("explorer_api_url", defaults.explorer_api_url)?
            .set_default("price_api_url", defaults.price_api_url)?
            .set_default("price_coin_id", defaults.price_coin_id)?
            .set_default("token_address", defaults.token_address)?
            .set_default("dead_address", defaults.dead_address)?
            .set_default("start_date", START_DATE)?
            .set_default("token_decimals", defaults.token_decimals as i64)?
            .set_default("refresh_interval_secs", defaults.refresh_interval_secs as i64)?
            .set_default("page_delay_ms", defaults.page_delay_ms as i64)?
            .set_default(
                "historical_price_delay_ms",
                defaults.historical_price_delay_ms as i64,
            )?
            .set_default("retry_max_attempts", defaults.retry_max_attempts as i64)?
            .set_default("retry_base_delay_ms", defaults.retry_base_delay_ms as i64)?
            .set_default("retry_multiplier", defaults.retry_multiplier)?
            .set_default("http_timeout_secs", defaults.http_timeout_secs as i64)?
            .add_source(::config::Environment::with_prefix("BURNWATCH").try_parsing(true))
            .build()?
            .try_deserialize()
            .context("invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.token()?;
        self.dead()?;
        if self.retry_max_attempts == 0 {
            anyhow::bail!("retry_max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn token(&self) -> Result<Address> {
        self.token_address
            .parse()
            .with_context(|| format!("invalid token address {}", self.token_address))
    }

    pub fn dead(&self) -> Result<Address> {
        self.dead_address
            .parse()
            .with_context(|| format!("invalid dead address {}", self.dead_address))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            self.retry_multiplier,
        )
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.http_timeout_secs))
            .user_agent(concat!("uni-burn-tracker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(client)
    }
}
