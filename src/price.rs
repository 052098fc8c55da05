use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, warn};
use moka::future::Cache;
use serde::Deserialize;
use tokio::time::sleep;

use crate::config::Config;
use crate::explorer::BlockscoutClient;
use crate::retry::{get_json, RetryPolicy};

/// USD price lookups. Failures surface as `None`, never as errors.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn current_price(&self) -> Option<f64>;

    async fn historical_price(&self, date: NaiveDate) -> Option<f64>;

    async fn historical_price_or(&self, date: NaiveDate, fallback: Option<f64>) -> Option<f64> {
        match self.historical_price(date).await {
            Some(price) => Some(price),
            None => fallback,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    market_data: Option<MarketData>,
}

#[derive(Debug, Deserialize)]
struct MarketData {
    #[serde(default)]
    current_price: HashMap<String, f64>,
}

/// `coins/{id}/history` takes `dd-mm-yyyy`.
pub fn history_date_param(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

fn usd_from_history(body: HistoryResponse) -> Option<f64> {
    body.market_data?.current_price.get("usd").copied()
}

#[derive(Clone)]
pub struct MarketPriceClient {
    explorer: BlockscoutClient,
    http: reqwest::Client,
    base_url: String,
    coin_id: String,
    retry: RetryPolicy,
    historical_delay: Duration,
    // A past day's price never changes; entries live for the whole process.
    history: Cache<NaiveDate, f64>,
}

impl MarketPriceClient {
    pub fn new(config: &Config, explorer: BlockscoutClient, http: reqwest::Client) -> Self {
        Self {
            explorer,
            http,
            base_url: config.price_api_url.trim_end_matches('/').to_string(),
            coin_id: config.price_coin_id.clone(),
            retry: config.retry_policy(),
            historical_delay: Duration::from_millis(config.historical_price_delay_ms),
            history: Cache::builder().max_capacity(10_000).build(),
        }
    }

    async fn simple_price(&self) -> Option<f64> {
        let url = format!("{}/simple/price", self.base_url);
        let result: Result<HashMap<String, HashMap<String, f64>>, _> = self
            .retry
            .run("spot price", || {
                get_json(
                    self.http
                        .get(&url)
                        .query(&[("ids", self.coin_id.as_str()), ("vs_currencies", "usd")]),
                )
            })
            .await;

        match result {
            Ok(prices) => prices.get(&self.coin_id).and_then(|p| p.get("usd")).copied(),
            Err(e) => {
                warn!("Error fetching spot price for {}: {}", self.coin_id, e);
                None
            }
        }
    }

    async fn fetch_history(&self, date: NaiveDate) -> Option<f64> {
        let url = format!("{}/coins/{}/history", self.base_url, self.coin_id);
        let formatted = history_date_param(date);

        let result: Result<HistoryResponse, _> = self
            .retry
            .run("historical price", || {
                get_json(
                    self.http
                        .get(&url)
                        .query(&[("date", formatted.as_str()), ("localization", "false")]),
                )
            })
            .await;

        match result {
            Ok(body) => usd_from_history(body),
            Err(e) => {
                warn!("Error fetching historical price for {}: {}", date, e);
                None
            }
        }
    }

    pub async fn clear_cache(&self) {
        self.history.invalidate_all();
        self.history.run_pending_tasks().await;
    }
}

#[async_trait]
impl PriceSource for MarketPriceClient {
    async fn current_price(&self) -> Option<f64> {
        if let Some(rate) = self.explorer.exchange_rate().await {
            return Some(rate);
        }
        debug!("Explorer has no exchange rate, asking the price API");
        self.simple_price().await
    }

    async fn historical_price(&self, date: NaiveDate) -> Option<f64> {
        if let Some(price) = self.history.get(&date).await {
            debug!("Historical price cache hit for {}", date);
            return Some(price);
        }

        sleep(self.historical_delay).await;

        let price = self.fetch_history(date).await?;
        self.history.insert(date, price).await;
        Some(price)
    }
}
