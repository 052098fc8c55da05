mod cli;
mod config;
mod database;
mod explorer;
mod models;
mod price;
mod retry;
mod sync;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::Config;
use database::Database;
use explorer::BlockscoutClient;
use log::info;
use price::MarketPriceClient;
use sync::BurnSyncer;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let database = Arc::new(Database::new(&config.database_url).await?);

    let http = config.http_client()?;
    let explorer = BlockscoutClient::new(&config, http.clone())?;
    let prices = MarketPriceClient::new(&config, explorer.clone(), http);
    let syncer = BurnSyncer::new(explorer, prices, database.clone(), config.start_date);

    match cli.command {
        Commands::Sync => {
            let report = syncer.sync().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Watch { interval_secs } => {
            let interval = Duration::from_secs(interval_secs.unwrap_or(config.refresh_interval_secs));
            tokio::select! {
                result = syncer.start_watching(interval) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down"),
            }
        }
        Commands::Daily => {
            let series = syncer.daily_series().await?;
            println!("{}", serde_json::to_string_pretty(&series)?);
        }
        Commands::Summary => {
            let summary = syncer.summary().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Transactions { limit } => {
            let transactions = database.query_burn_transactions(limit.unwrap_or(100)).await?;
            for transaction in transactions {
                println!("{}", serde_json::to_string_pretty(&transaction)?);
            }
        }
        Commands::Stats => {
            let stats = database.get_stats().await?;
            println!("Database Statistics:");
            println!("Total transactions: {}", stats.total_transactions);
            println!("Days with burns: {}", stats.rollup_days);
            println!("Latest block: {}", stats.latest_block.unwrap_or(0));
            println!("Earliest block: {}", stats.earliest_block.unwrap_or(0));
        }
        Commands::Reset => {
            database.clear_all_data().await?;
            syncer.prices().clear_cache().await;
            println!("Cleared all burn transactions and daily rollups");
        }
    }

    database.close().await;
    Ok(())
}
