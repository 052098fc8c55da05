use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, SecondsFormat, Utc};
use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::database::Database;
use crate::explorer::TransferFeed;
use crate::models::{BurnSummary, BurnTransaction, DailyBurn, DailyPoint, SyncReport};
use crate::price::PriceSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    FetchingNew,
    PricingNew,
    PersistingNew,
    RecomputingRollups,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::FetchingNew => "fetching new transfers",
            SyncStage::PricingNew => "pricing new transfers",
            SyncStage::PersistingNew => "persisting new transfers",
            SyncStage::RecomputingRollups => "recomputing daily rollups",
        };
        f.write_str(name)
    }
}

/// Pulls new burns into the store and rebuilds every daily rollup.
///
/// Rollups are recomputed from the full transaction history on each run, so
/// a run costs time proportional to the number of stored transactions. In
/// exchange any earlier partial or interrupted run is repaired by the next one.
pub struct BurnSyncer<F, P> {
    feed: F,
    prices: P,
    database: Arc<Database>,
    start_date: NaiveDate,
    run_lock: Mutex<()>,
}

impl<F: TransferFeed, P: PriceSource> BurnSyncer<F, P> {
    pub fn new(feed: F, prices: P, database: Arc<Database>, start_date: NaiveDate) -> Self {
        Self {
            feed,
            prices,
            database,
            start_date,
            run_lock: Mutex::new(()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn prices(&self) -> &P {
        &self.prices
    }

    /// Runs one sync cycle. Failures are reported in the result, never returned.
    pub async fn sync(&self) -> SyncReport {
        let _guard = self.run_lock.lock().await;
        let now = Utc::now();
        let last_updated = now.to_rfc3339_opts(SecondsFormat::Millis, true);

        match self.run_cycle(now.date_naive(), &last_updated).await {
            Ok(report) => {
                info!(
                    "Sync done: {} new transactions, {} burned in total",
                    report.new_transaction_count, report.total_burned
                );
                report
            }
            Err(e) => {
                error!("Sync failed: {:#}", e);
                SyncReport::failed(last_updated, format!("{:#}", e))
            }
        }
    }

    async fn run_cycle(&self, today: NaiveDate, last_updated: &str) -> Result<SyncReport> {
        info!("Sync stage: {}", SyncStage::FetchingNew);
        let resume_after = self
            .database
            .get_latest_burn_transaction()
            .await
            .with_context(|| SyncStage::FetchingNew.to_string())?
            .map(|tx| tx.block_number as u64);

        let mut new_transactions = match self
            .feed
            .fetch_transfers_since(self.start_date, resume_after)
            .await
        {
            Ok(txs) => txs,
            Err(e) => {
                // Persisting the newest pages alone would move the resume point
                // past the pages that were never fetched.
                warn!(
                    "Discarding {} transfers from an incomplete fetch",
                    e.collected.len()
                );
                return Err(e).context(SyncStage::FetchingNew.to_string());
            }
        };

        info!("Sync stage: {}", SyncStage::PricingNew);
        let current_price = self.prices.current_price().await;
        match current_price {
            Some(price) => new_transactions
                .iter_mut()
                .for_each(|tx| tx.apply_price(price)),
            None => warn!(
                "Current price unavailable, storing {} transactions unpriced",
                new_transactions.len()
            ),
        }

        info!("Sync stage: {}", SyncStage::PersistingNew);
        if !new_transactions.is_empty() {
            let inserted = self
                .database
                .insert_burn_transactions(&new_transactions)
                .await
                .with_context(|| SyncStage::PersistingNew.to_string())?;
            info!(
                "Stored {} of {} fetched transactions",
                inserted,
                new_transactions.len()
            );
        }

        info!("Sync stage: {}", SyncStage::RecomputingRollups);
        let total_burned = self
            .recompute_rollups(current_price, today, last_updated)
            .await
            .with_context(|| SyncStage::RecomputingRollups.to_string())?;

        Ok(SyncReport {
            success: true,
            new_transaction_count: new_transactions.len(),
            total_burned,
            current_price,
            last_updated: last_updated.to_string(),
            error: None,
        })
    }

    /// Rebuilds one rollup per day that has burns and returns the running total.
    pub async fn recompute_rollups(
        &self,
        current_price: Option<f64>,
        today: NaiveDate,
        updated_at: &str,
    ) -> Result<f64> {
        let transactions = self.database.get_burn_transactions().await?;
        let by_date = group_by_date(&transactions);
        let today_key = today.format("%Y-%m-%d").to_string();

        let mut cumulative_uni = 0.0;
        let mut cumulative_usd = 0.0;

        for (date, daily_uni) in by_date {
            cumulative_uni += daily_uni;

            let price = if date == today_key {
                current_price
            } else {
                match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                    Ok(day) => self.prices.historical_price_or(day, current_price).await,
                    Err(_) => {
                        warn!("Unparseable burn date {}, using current price", date);
                        current_price
                    }
                }
            };

            let daily_usd_value = price.map(|p| daily_uni * p);
            cumulative_usd += daily_usd_value.unwrap_or(0.0);

            self.database
                .upsert_daily_burn(&DailyBurn {
                    date: date.to_string(),
                    cumulative_uni,
                    daily_uni,
                    uni_price_usd: price,
                    daily_usd_value,
                    cumulative_usd_value: Some(cumulative_usd),
                    updated_at: updated_at.to_string(),
                })
                .await?;
        }

        if transactions.is_empty() {
            if let Some(balance) = self.feed.dead_address_balance().await {
                if balance > 0.0 {
                    info!(
                        "No burns stored yet, dead address currently holds {}",
                        balance
                    );
                }
            }
        }

        Ok(cumulative_uni)
    }

    pub async fn daily_series(&self) -> Result<Vec<DailyPoint>> {
        let from = self.start_date.format("%Y-%m-%d").to_string();
        let burns = self.database.get_daily_burns(&from).await?;
        Ok(DailyPoint::series(burns, Utc::now().date_naive()))
    }

    pub async fn summary(&self) -> Result<BurnSummary> {
        let since = self.start_date.format("%Y-%m-%d").to_string();
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();

        let total_uni_burned = self.database.total_burned_since(&since).await?;
        let today_burns = self.database.burned_on_date(&today).await?;
        let historical = self.database.usd_value_since(&since).await?;
        let last_updated = match self.database.get_latest_daily_burn().await? {
            Some(burn) => burn.updated_at,
            None => Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let current_uni_price = self.prices.current_price().await;

        Ok(BurnSummary {
            total_uni_burned,
            current_usd_value: current_uni_price.map(|p| total_uni_burned * p),
            historical_usd_value: (historical != 0.0).then_some(historical),
            today_burns,
            current_uni_price,
            last_updated,
        })
    }

    /// Syncs immediately, then every `interval`, until the process stops.
    pub async fn start_watching(&self, interval: Duration) -> Result<()> {
        info!("Watching burns every {:?}", interval);

        loop {
            let report = self.sync().await;
            if !report.success {
                warn!(
                    "Keeping previous rollups after failed sync: {}",
                    report.error.as_deref().unwrap_or("unknown error")
                );
            }
            sleep(interval).await;
        }
    }
}

/// Sums amounts per UTC calendar date, ascending.
fn group_by_date(transactions: &[BurnTransaction]) -> BTreeMap<&str, f64> {
    let mut by_date = BTreeMap::new();
    for tx in transactions {
        *by_date.entry(tx.date()).or_insert(0.0) += tx.uni_amount;
    }
    by_date
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorer::FeedError;
    use crate::retry::FetchError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn tx(hash: &str, block: i64, timestamp: &str, amount: f64) -> BurnTransaction {
        BurnTransaction {
            tx_hash: hash.to_string(),
            block_number: block,
            timestamp: timestamp.to_string(),
            uni_amount: amount,
            uni_price_usd: None,
            usd_value: None,
            from_address: "0x00000000000000000000000000000000000000aa".to_string(),
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    /// Serves a fixed newest-first transfer list and honours the resume block.
    #[derive(Default)]
    struct FakeFeed {
        transfers: StdMutex<Vec<BurnTransaction>>,
        fail: bool,
        requested_resume: StdMutex<Vec<Option<u64>>>,
    }

    impl FakeFeed {
        fn with(mut transfers: Vec<BurnTransaction>) -> Self {
            transfers.sort_by(|a, b| b.block_number.cmp(&a.block_number));
            Self {
                transfers: StdMutex::new(transfers),
                ..Self::default()
            }
        }

        fn push(&self, transfer: BurnTransaction) {
            let mut transfers = self.transfers.lock().unwrap();
            transfers.push(transfer);
            transfers.sort_by(|a, b| b.block_number.cmp(&a.block_number));
        }
    }

    #[async_trait]
    impl TransferFeed for FakeFeed {
        async fn fetch_transfers_since(
            &self,
            start_date: NaiveDate,
            resume_after_block: Option<u64>,
        ) -> Result<Vec<BurnTransaction>, FeedError> {
            self.requested_resume.lock().unwrap().push(resume_after_block);
            let start = start_date.format("%Y-%m-%d").to_string();
            let collected: Vec<_> = self
                .transfers
                .lock()
                .unwrap()
                .iter()
                .take_while(|t| t.date() >= start.as_str())
                .take_while(|t| resume_after_block.map_or(true, |b| t.block_number as u64 > b))
                .cloned()
                .collect();

            if self.fail {
                return Err(FeedError {
                    source: FetchError::RateLimited,
                    collected,
                });
            }
            Ok(collected)
        }

        async fn dead_address_balance(&self) -> Option<f64> {
            None
        }
    }

    #[derive(Default)]
    struct FakePrices {
        current: Option<f64>,
        history: HashMap<NaiveDate, f64>,
    }

    #[async_trait]
    impl PriceSource for FakePrices {
        async fn current_price(&self) -> Option<f64> {
            self.current
        }

        async fn historical_price(&self, date: NaiveDate) -> Option<f64> {
            self.history.get(&date).copied()
        }
    }

    async fn syncer(feed: FakeFeed, prices: FakePrices) -> BurnSyncer<FakeFeed, FakePrices> {
        let database = Arc::new(Database::in_memory().await.unwrap());
        BurnSyncer::new(feed, prices, database, date("2025-12-29"))
    }

    fn scenario() -> Vec<BurnTransaction> {
        vec![
            tx("0x01", 100, "2025-12-29T10:00:00Z", 10.0),
            tx("0x02", 101, "2025-12-29T18:30:00Z", 5.0),
            tx("0x03", 200, "2025-12-30T09:00:00Z", 3.0),
        ]
    }

    #[tokio::test]
    async fn end_to_end_builds_cumulative_rollups() {
        let prices = FakePrices {
            current: Some(4.0),
            ..FakePrices::default()
        };
        let syncer = syncer(FakeFeed::with(scenario()), prices).await;

        let report = syncer.sync().await;

        assert!(report.success);
        assert_eq!(report.new_transaction_count, 3);
        assert_eq!(report.total_burned, 18.0);
        assert_eq!(report.current_price, Some(4.0));

        let db = syncer.database();
        let first = db.get_daily_burn("2025-12-29").await.unwrap().unwrap();
        assert_eq!(first.daily_uni, 15.0);
        assert_eq!(first.cumulative_uni, 15.0);
        assert_eq!(first.cumulative_usd_value, Some(60.0));

        let second = db.get_daily_burn("2025-12-30").await.unwrap().unwrap();
        assert_eq!(second.daily_uni, 3.0);
        assert_eq!(second.cumulative_uni, 18.0);
        assert_eq!(second.cumulative_usd_value, Some(72.0));

        let stored = db.get_burn_transactions().await.unwrap();
        assert!(stored.iter().all(|t| t.uni_price_usd == Some(4.0)));
    }

    #[tokio::test]
    async fn missing_history_falls_back_to_current_price() {
        let prices = FakePrices {
            current: Some(5.0),
            ..FakePrices::default()
        };
        let syncer = syncer(FakeFeed::with(scenario()), prices).await;

        syncer.sync().await;

        let burn = syncer
            .database()
            .get_daily_burn("2025-12-29")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(burn.uni_price_usd, Some(5.0));
        assert_eq!(burn.daily_usd_value, Some(15.0 * 5.0));
    }

    #[tokio::test]
    async fn historical_prices_win_over_current() {
        let prices = FakePrices {
            current: Some(5.0),
            history: HashMap::from([(date("2025-12-29"), 2.0), (date("2025-12-30"), 3.0)]),
        };
        let syncer = syncer(FakeFeed::with(scenario()), prices).await;

        syncer.sync().await;

        let series = syncer.daily_series().await.unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].usd_value, Some(30.0));
        assert_eq!(series[1].usd_value, Some(9.0));
        assert_eq!(series[1].cumulative_usd_value, Some(39.0));
    }

    #[tokio::test]
    async fn todays_rollup_uses_current_price() {
        let prices = FakePrices {
            current: Some(5.0),
            history: HashMap::from([(date("2025-12-30"), 3.0)]),
        };
        let syncer = syncer(FakeFeed::with(scenario()), prices).await;
        syncer
            .database()
            .insert_burn_transactions(&scenario())
            .await
            .unwrap();

        syncer
            .recompute_rollups(Some(5.0), date("2025-12-30"), "2025-12-30T12:00:00Z")
            .await
            .unwrap();

        let today = syncer
            .database()
            .get_daily_burn("2025-12-30")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(today.uni_price_usd, Some(5.0));
        assert_eq!(today.updated_at, "2025-12-30T12:00:00Z");
    }

    #[tokio::test]
    async fn unreachable_prices_still_persist_transactions() {
        let syncer = syncer(FakeFeed::with(scenario()), FakePrices::default()).await;

        let report = syncer.sync().await;

        assert!(report.success);
        assert_eq!(report.current_price, None);

        let stored = syncer.database().get_burn_transactions().await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|t| t.uni_price_usd.is_none() && t.usd_value.is_none()));

        let burn = syncer
            .database()
            .get_daily_burn("2025-12-30")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(burn.daily_usd_value, None);
        assert_eq!(burn.cumulative_usd_value, Some(0.0));
        assert_eq!(burn.cumulative_uni, 18.0);
    }

    #[tokio::test]
    async fn second_run_resumes_after_latest_block() {
        let prices = FakePrices {
            current: Some(4.0),
            ..FakePrices::default()
        };
        let syncer = syncer(FakeFeed::with(scenario()), prices).await;
        syncer.sync().await;

        syncer.feed.push(tx("0x04", 250, "2025-12-30T20:00:00Z", 2.0));
        let report = syncer.sync().await;

        assert_eq!(report.new_transaction_count, 1);
        assert_eq!(report.total_burned, 20.0);
        assert_eq!(
            *syncer.feed.requested_resume.lock().unwrap(),
            vec![None, Some(200)]
        );
    }

    #[tokio::test]
    async fn repeated_sync_is_idempotent() {
        let prices = FakePrices {
            current: Some(4.0),
            ..FakePrices::default()
        };
        let syncer = syncer(FakeFeed::with(scenario()), prices).await;

        let first = syncer.sync().await;
        let second = syncer.sync().await;

        assert_eq!(first.total_burned, second.total_burned);
        assert_eq!(second.new_transaction_count, 0);
        let stats = syncer.database().get_stats().await.unwrap();
        assert_eq!(stats.total_transactions, 3);
        assert_eq!(stats.rollup_days, 2);
    }

    #[tokio::test]
    async fn cumulative_totals_match_daily_sums() {
        let mut transfers = scenario();
        transfers.push(tx("0x05", 300, "2025-12-31T01:00:00Z", 7.5));
        transfers.push(tx("0x06", 301, "2026-01-02T01:00:00Z", 0.25));
        let syncer = syncer(FakeFeed::with(transfers), FakePrices::default()).await;

        syncer.sync().await;

        let burns = syncer.database().get_daily_burns("2025-12-29").await.unwrap();
        assert_eq!(burns.len(), 4);
        for window in burns.windows(2) {
            assert!(window[1].cumulative_uni >= window[0].cumulative_uni);
            let step = window[1].cumulative_uni - window[0].cumulative_uni;
            assert!((step - window[1].daily_uni).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn failed_fetch_reports_failure_and_stores_nothing() {
        let feed = FakeFeed {
            fail: true,
            ..FakeFeed::with(scenario())
        };
        let syncer = syncer(feed, FakePrices::default()).await;

        let report = syncer.sync().await;

        assert!(!report.success);
        assert_eq!(report.new_transaction_count, 0);
        assert!(report.error.unwrap().contains("fetching new transfers"));
        assert_eq!(syncer.database().get_stats().await.unwrap().total_transactions, 0);
    }

    #[tokio::test]
    async fn empty_history_produces_no_rollups() {
        let syncer = syncer(FakeFeed::default(), FakePrices::default()).await;

        let report = syncer.sync().await;

        assert!(report.success);
        assert_eq!(report.total_burned, 0.0);
        assert!(syncer.daily_series().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_values_burns_at_current_price() {
        let prices = FakePrices {
            current: Some(4.0),
            ..FakePrices::default()
        };
        let syncer = syncer(FakeFeed::with(scenario()), prices).await;
        let report = syncer.sync().await;

        let summary = syncer.summary().await.unwrap();

        assert_eq!(summary.total_uni_burned, 18.0);
        assert_eq!(summary.current_uni_price, Some(4.0));
        assert_eq!(summary.current_usd_value, Some(72.0));
        assert_eq!(summary.historical_usd_value, Some(72.0));
        assert_eq!(summary.today_burns, 0.0);
        assert_eq!(summary.last_updated, report.last_updated);
    }

    #[tokio::test]
    async fn unpriced_summary_has_no_usd_values() {
        let syncer = syncer(FakeFeed::with(scenario()), FakePrices::default()).await;
        syncer.sync().await;

        let summary = syncer.summary().await.unwrap();

        assert_eq!(summary.current_usd_value, None);
        assert_eq!(summary.historical_usd_value, None);
    }

    #[test]
    fn groups_by_utc_date_ascending() {
        let txs = vec![
            tx("0x03", 200, "2025-12-30T09:00:00Z", 3.0),
            tx("0x01", 100, "2025-12-29T10:00:00Z", 10.0),
            tx("0x02", 101, "2025-12-29T18:30:00Z", 5.0),
        ];
        let grouped: Vec<_> = group_by_date(&txs).into_iter().collect();
        assert_eq!(grouped, vec![("2025-12-29", 15.0), ("2025-12-30", 3.0)]);
    }
}
