use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "uni-burn-tracker")]
#[command(about = "Tracks UNI burned to the dead address and rolls it up per day")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one sync cycle and print the result
    Sync,
    /// Sync now and then on a fixed interval
    Watch {
        #[arg(short, long)]
        interval_secs: Option<u64>,
    },
    /// Print the daily burn series
    Daily,
    /// Print totals and current valuation
    Summary,
    /// Print stored burn transactions, newest first
    Transactions {
        #[arg(short, long)]
        limit: Option<i64>,
    },
    Stats,
    /// Delete all stored transactions and rollups
    Reset,
}
