use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::models::{BurnTransaction, DailyBurn, DatabaseStats};

const INSERT_BURN: &str = r#"
    INSERT OR IGNORE INTO burn_transactions
    (tx_hash, block_number, timestamp, uni_amount, uni_price_usd, usd_value, from_address)
    VALUES (?, ?, ?, ?, ?, ?, ?)
"#;

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let filename = options.clone().get_filename();
        if let Some(dir) = filename.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let db = Self { pool };
        db.create_tables().await?;
        Ok(db)
    }

    /// Private database on a single pinned connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.create_tables().await?;
        Ok(db)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS burn_transactions (
                tx_hash TEXT PRIMARY KEY,
                block_number INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                uni_amount REAL NOT NULL,
                uni_price_usd REAL,
                usd_value REAL,
                from_address TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_burns (
                date TEXT PRIMARY KEY,
                cumulative_uni REAL NOT NULL,
                daily_uni REAL NOT NULL,
                uni_price_usd REAL,
                daily_usd_value REAL,
                cumulative_usd_value REAL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_burn_transactions_timestamp ON burn_transactions(timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_burn_transactions_block ON burn_transactions(block_number)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_burn_transaction(&self, tx: &BurnTransaction) -> Result<()> {
        sqlx::query(INSERT_BURN)
            .bind(&tx.tx_hash)
            .bind(tx.block_number)
            .bind(&tx.timestamp)
            .bind(tx.uni_amount)
            .bind(tx.uni_price_usd)
            .bind(tx.usd_value)
            .bind(&tx.from_address)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Inserts the batch inside one transaction; known hashes are skipped.
    /// Returns how many rows were actually new.
    pub async fn insert_burn_transactions(&self, txs: &[BurnTransaction]) -> Result<u64> {
        let mut db_tx = self.pool.begin().await?;
        let mut inserted = 0;

        for tx in txs {
            let result = sqlx::query(INSERT_BURN)
                .bind(&tx.tx_hash)
                .bind(tx.block_number)
                .bind(&tx.timestamp)
                .bind(tx.uni_amount)
                .bind(tx.uni_price_usd)
                .bind(tx.usd_value)
                .bind(&tx.from_address)
                .execute(&mut *db_tx)
                .await?;
            inserted += result.rows_affected();
        }

        db_tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get_burn_transactions(&self) -> Result<Vec<BurnTransaction>> {
        let txs = sqlx::query_as::<_, BurnTransaction>(
            "SELECT * FROM burn_transactions ORDER BY timestamp DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(txs)
    }

    pub async fn query_burn_transactions(&self, limit: i64) -> Result<Vec<BurnTransaction>> {
        let txs = sqlx::query_as::<_, BurnTransaction>(
            "SELECT * FROM burn_transactions ORDER BY timestamp DESC, block_number DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(txs)
    }

    pub async fn get_latest_burn_transaction(&self) -> Result<Option<BurnTransaction>> {
        let tx = sqlx::query_as::<_, BurnTransaction>(
            "SELECT * FROM burn_transactions ORDER BY block_number DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(tx)
    }

    /// `since` is a `YYYY-MM-DD` date; ISO timestamps compare lexically.
    pub async fn total_burned_since(&self, since: &str) -> Result<f64> {
        let total: f64 = sqlx::query_scalar(
            "SELECT TOTAL(uni_amount) FROM burn_transactions WHERE timestamp >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    pub async fn burned_on_date(&self, date: &str) -> Result<f64> {
        let total: f64 = sqlx::query_scalar(
            "SELECT TOTAL(uni_amount) FROM burn_transactions WHERE substr(timestamp, 1, 10) = ?",
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    /// Unpriced transactions count as zero.
    pub async fn usd_value_since(&self, since: &str) -> Result<f64> {
        let total: f64 = sqlx::query_scalar(
            "SELECT TOTAL(usd_value) FROM burn_transactions WHERE usd_value IS NOT NULL AND timestamp >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    pub async fn upsert_daily_burn(&self, burn: &DailyBurn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_burns
            (date, cumulative_uni, daily_uni, uni_price_usd, daily_usd_value, cumulative_usd_value, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET
                cumulative_uni = excluded.cumulative_uni,
                daily_uni = excluded.daily_uni,
                uni_price_usd = excluded.uni_price_usd,
                daily_usd_value = excluded.daily_usd_value,
                cumulative_usd_value = excluded.cumulative_usd_value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&burn.date)
        .bind(burn.cumulative_uni)
        .bind(burn.daily_uni)
        .bind(burn.uni_price_usd)
        .bind(burn.daily_usd_value)
        .bind(burn.cumulative_usd_value)
        .bind(&burn.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_daily_burns(&self, from_date: &str) -> Result<Vec<DailyBurn>> {
        let burns = sqlx::query_as::<_, DailyBurn>(
            "SELECT * FROM daily_burns WHERE date >= ? ORDER BY date ASC",
        )
        .bind(from_date)
        .fetch_all(&self.pool)
        .await?;

        Ok(burns)
    }

    pub async fn get_daily_burn(&self, date: &str) -> Result<Option<DailyBurn>> {
        let burn = sqlx::query_as::<_, DailyBurn>("SELECT * FROM daily_burns WHERE date = ?")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;

        Ok(burn)
    }

    pub async fn get_latest_daily_burn(&self) -> Result<Option<DailyBurn>> {
        let burn = sqlx::query_as::<_, DailyBurn>(
            "SELECT * FROM daily_burns ORDER BY date DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(burn)
    }

    pub async fn get_stats(&self) -> Result<DatabaseStats> {
        let total_transactions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM burn_transactions")
            .fetch_one(&self.pool)
            .await?;

        let rollup_days: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM daily_burns")
            .fetch_one(&self.pool)
            .await?;

        let (earliest_block, latest_block): (Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT MIN(block_number), MAX(block_number) FROM burn_transactions",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DatabaseStats {
            total_transactions,
            rollup_days,
            latest_block,
            earliest_block,
        })
    }

    pub async fn clear_all_data(&self) -> Result<()> {
        let mut db_tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM daily_burns")
            .execute(&mut *db_tx)
            .await?;
        sqlx::query("DELETE FROM burn_transactions")
            .execute(&mut *db_tx)
            .await?;
        db_tx.commit().await?;
        Ok(())
    }
}
