use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One transfer of the tracked token into the dead address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BurnTransaction {
    pub tx_hash: String,
    pub block_number: i64,
    /// UTC RFC 3339, so the first ten characters are the calendar date.
    pub timestamp: String,
    pub uni_amount: f64,
    pub uni_price_usd: Option<f64>,
    pub usd_value: Option<f64>,
    pub from_address: String,
}

impl BurnTransaction {
    pub fn date(&self) -> &str {
        self.timestamp.get(..10).unwrap_or(&self.timestamp)
    }

    pub fn apply_price(&mut self, price: f64) {
        self.uni_price_usd = Some(price);
        self.usd_value = Some(self.uni_amount * price);
    }
}

/// Per-day rollup, recomputed in full on every sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DailyBurn {
    pub date: String,
    pub cumulative_uni: f64,
    pub daily_uni: f64,
    pub uni_price_usd: Option<f64>,
    pub daily_usd_value: Option<f64>,
    pub cumulative_usd_value: Option<f64>,
    pub updated_at: String,
}

/// A row of the daily series served to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPoint {
    pub date: String,
    pub display_date: String,
    pub cumulative_uni: f64,
    pub daily_uni: f64,
    pub usd_value: Option<f64>,
    pub cumulative_usd_value: Option<f64>,
    pub is_live: bool,
}

impl DailyPoint {
    pub fn series(burns: Vec<DailyBurn>, today: NaiveDate) -> Vec<DailyPoint> {
        let today = today.format("%Y-%m-%d").to_string();
        let last = burns.len().saturating_sub(1);

        burns
            .into_iter()
            .enumerate()
            .map(|(i, burn)| {
                let display_date = NaiveDate::parse_from_str(&burn.date, "%Y-%m-%d")
                    .map(|d| d.format("%b %-d").to_string())
                    .unwrap_or_else(|_| burn.date.clone());
                let is_live = i == last && burn.date == today;

                DailyPoint {
                    display_date,
                    is_live,
                    cumulative_uni: burn.cumulative_uni,
                    daily_uni: burn.daily_uni,
                    usd_value: burn.daily_usd_value,
                    cumulative_usd_value: burn.cumulative_usd_value,
                    date: burn.date,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurnSummary {
    pub total_uni_burned: f64,
    pub current_usd_value: Option<f64>,
    pub historical_usd_value: Option<f64>,
    pub today_burns: f64,
    pub current_uni_price: Option<f64>,
    pub last_updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub new_transaction_count: usize,
    pub total_burned: f64,
    pub current_price: Option<f64>,
    pub last_updated: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncReport {
    pub fn failed(last_updated: String, error: String) -> Self {
        Self {
            success: false,
            new_transaction_count: 0,
            total_burned: 0.0,
            current_price: None,
            last_updated,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DatabaseStats {
    pub total_transactions: i64,
    pub rollup_days: i64,
    pub latest_block: Option<i64>,
    pub earliest_block: Option<i64>,
}
