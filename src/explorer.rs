use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use ethers_core::types::{Address, U256};
use ethers_core::utils::format_units;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;

use crate::config::Config;
use crate::models::BurnTransaction;
use crate::retry::{get_json, FetchError, RetryPolicy};

/// Feed failure, carrying whatever was collected before the failing page.
#[derive(Debug, Error)]
#[error("transfer feed failed after {} transfers: {source}", .collected.len())]
pub struct FeedError {
    #[source]
    pub source: FetchError,
    pub collected: Vec<BurnTransaction>,
}

/// Source of burn transfers, newest first.
#[async_trait]
pub trait TransferFeed: Send + Sync {
    /// Transfers at or after `start_date`, stopping at `resume_after_block` when given.
    /// Precondition: the upstream delivers items in reverse-chronological block order.
    ///
    /// Transfers of other tokens are skipped before either stop condition is checked,
    /// so a feed that mixes tokens is walked until an older tracked transfer shows up.
    /// `BlockscoutClient` asks the explorer to filter by token to keep that walk short.
    async fn fetch_transfers_since(
        &self,
        start_date: NaiveDate,
        resume_after_block: Option<u64>,
    ) -> Result<Vec<BurnTransaction>, FeedError>;

    /// Token balance currently held by the dead address, if it can be read.
    async fn dead_address_balance(&self) -> Option<f64>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageParams {
    pub block_number: u64,
    pub index: u64,
    pub items_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct TransferPage {
    pub items: Vec<TokenTransfer>,
    pub next_page_params: Option<PageParams>,
}

#[derive(Debug, Deserialize)]
pub struct TokenTransfer {
    pub block_number: u64,
    pub timestamp: String,
    pub transaction_hash: String,
    pub from: AddressRef,
    pub token: TokenRef,
    pub total: TransferTotal,
}

#[derive(Debug, Deserialize)]
pub struct AddressRef {
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenRef {
    pub address: String,
    #[serde(default)]
    pub decimals: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransferTotal {
    pub value: String,
    pub decimals: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenInfo {
    pub address: String,
    #[serde(default)]
    pub exchange_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenBalance {
    pub token: TokenRef,
    pub value: String,
}

#[derive(Debug, PartialEq)]
pub enum PageVerdict {
    Continue,
    Stop,
}

/// Converts a raw integer amount to a human amount with 256-bit precision.
pub fn scale_amount(raw: &str, decimals: u32) -> Result<f64, FetchError> {
    let value = U256::from_dec_str(raw)
        .map_err(|e| FetchError::Malformed(format!("amount {raw}: {e}")))?;
    let formatted = format_units(value, decimals)
        .map_err(|e| FetchError::Malformed(format!("decimals {decimals}: {e}")))?;
    formatted
        .parse()
        .map_err(|e| FetchError::Malformed(format!("amount {formatted}: {e}")))
}

fn parse_address(raw: &str) -> Option<Address> {
    raw.parse().ok()
}

fn normalize_timestamp(raw: &str) -> Result<DateTime<Utc>, FetchError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FetchError::Malformed(format!("timestamp {raw}: {e}")))
}

/// Applies the token filter and both stop conditions to one page, in arrival order.
pub fn collect_page(
    items: Vec<TokenTransfer>,
    token: Address,
    default_decimals: u32,
    start: DateTime<Utc>,
    resume_after_block: Option<u64>,
    out: &mut Vec<BurnTransaction>,
) -> Result<PageVerdict, FetchError> {
    for transfer in items {
        if parse_address(&transfer.token.address) != Some(token) {
            continue;
        }

        let timestamp = normalize_timestamp(&transfer.timestamp)?;
        if timestamp < start {
            return Ok(PageVerdict::Stop);
        }

        if let Some(after) = resume_after_block {
            if transfer.block_number <= after {
                return Ok(PageVerdict::Stop);
            }
        }

        let decimals = transfer
            .total
            .decimals
            .as_deref()
            .or(transfer.token.decimals.as_deref());
        let decimals = match decimals {
            Some(d) => d
                .parse()
                .map_err(|_| FetchError::Malformed(format!("decimals {d}")))?,
            None => default_decimals,
        };

        out.push(BurnTransaction {
            tx_hash: transfer.transaction_hash,
            block_number: transfer.block_number as i64,
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            uni_amount: scale_amount(&transfer.total.value, decimals)?,
            uni_price_usd: None,
            usd_value: None,
            from_address: transfer.from.hash,
        });
    }

    Ok(PageVerdict::Continue)
}

#[derive(Clone)]
pub struct BlockscoutClient {
    http: reqwest::Client,
    base_url: String,
    token: Address,
    token_address: String,
    dead_address: String,
    token_decimals: u32,
    retry: RetryPolicy,
    page_delay: Duration,
}

impl BlockscoutClient {
    pub fn new(config: &Config, http: reqwest::Client) -> Result<Self> {
        Ok(Self {
            http,
            base_url: config.explorer_api_url.trim_end_matches('/').to_string(),
            token: config.token()?,
            token_address: config.token_address.clone(),
            dead_address: config.dead_address.clone(),
            token_decimals: config.token_decimals,
            retry: config.retry_policy(),
            page_delay: Duration::from_millis(config.page_delay_ms),
        })
    }

    async fn fetch_page(&self, cursor: Option<&PageParams>) -> Result<TransferPage, FetchError> {
        let url = format!(
            "{}/addresses/{}/token-transfers",
            self.base_url, self.dead_address
        );

        self.retry
            .run("transfer page", || {
                let mut request = self
                    .http
                    .get(&url)
                    .query(&[
                        ("type", "ERC-20"),
                        ("filter", "to"),
                        ("token", self.token_address.as_str()),
                    ]);
                if let Some(params) = cursor {
                    request = request.query(params);
                }
                get_json(request)
            })
            .await
    }

    pub async fn get_token_info(&self) -> Result<TokenInfo, FetchError> {
        let url = format!("{}/tokens/{}", self.base_url, self.token_address);
        self.retry
            .run("token info", || get_json(self.http.get(&url)))
            .await
    }

    /// Spot price from the explorer's token metadata, when it has one.
    pub async fn exchange_rate(&self) -> Option<f64> {
        match self.get_token_info().await {
            Ok(info) => {
                debug!("Token {} exchange rate {:?}", info.address, info.exchange_rate);
                info.exchange_rate.and_then(|rate| rate.parse().ok())
            }
            Err(e) => {
                error!("Error fetching token info: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl TransferFeed for BlockscoutClient {
    async fn fetch_transfers_since(
        &self,
        start_date: NaiveDate,
        resume_after_block: Option<u64>,
    ) -> Result<Vec<BurnTransaction>, FeedError> {
        let start = start_date.and_time(NaiveTime::MIN).and_utc();
        let mut transactions = Vec::new();
        let mut cursor: Option<PageParams> = None;
        let mut pages = 0;

        loop {
            let page = match self.fetch_page(cursor.as_ref()).await {
                Ok(page) => page,
                Err(source) => {
                    return Err(FeedError {
                        source,
                        collected: transactions,
                    })
                }
            };
            pages += 1;

            let verdict = match collect_page(
                page.items,
                self.token,
                self.token_decimals,
                start,
                resume_after_block,
                &mut transactions,
            ) {
                Ok(verdict) => verdict,
                Err(source) => {
                    return Err(FeedError {
                        source,
                        collected: transactions,
                    })
                }
            };

            cursor = page.next_page_params;
            debug!("Page {} done, {} transfers so far", pages, transactions.len());

            if verdict == PageVerdict::Stop || cursor.is_none() {
                break;
            }

            sleep(self.page_delay).await;
        }

        info!(
            "Fetched {} burn transfers across {} pages",
            transactions.len(),
            pages
        );
        Ok(transactions)
    }

    async fn dead_address_balance(&self) -> Option<f64> {
        let url = format!(
            "{}/addresses/{}/token-balances",
            self.base_url, self.dead_address
        );

        let balances: Vec<TokenBalance> = match self
            .retry
            .run("token balances", || get_json(self.http.get(&url)))
            .await
        {
            Ok(balances) => balances,
            Err(e) => {
                error!("Error fetching dead address balance: {}", e);
                return None;
            }
        };

        let balance = balances
            .into_iter()
            .find(|b| parse_address(&b.token.address) == Some(self.token))?;
        let decimals = balance
            .token
            .decimals
            .as_deref()
            .and_then(|d| d.parse().ok())
            .unwrap_or(self.token_decimals);

        scale_amount(&balance.value, decimals).ok()
    }
}
