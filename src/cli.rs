use clap::{Args, Parser, Subcommand};

use crate::fetch::DEFAULT_BASE_URL;
use crate::key::State;

pub const DEFAULT_FIRST_YEAR: u16 = 2016;
pub const DEFAULT_LAST_YEAR: u16 = 2022;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Scrape(ScrapeArgs),
    Status(StatusArgs),
    Reset(ResetArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ScrapeArgs {
    /// State to scrape, by name or NREGA code (repeatable; default: all states).
    #[arg(long = "state")]
    pub states: Vec<State>,

    /// First audit year (e.g. 2015 for 2015-2016).
    #[arg(long, default_value_t = DEFAULT_FIRST_YEAR)]
    pub from_year: u16,

    /// Last audit year, inclusive.
    #[arg(long, default_value_t = DEFAULT_LAST_YEAR)]
    pub to_year: u16,

    /// Output directory for findings.csv and the completion log.
    #[arg(long, default_value = "data")]
    pub out: String,

    /// Report endpoint.
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Minimum delay between the starts of two requests (politeness).
    #[arg(long, default_value_t = 1000)]
    pub delay_ms: u64,

    /// Attempts per page before giving up.
    #[arg(long, default_value_t = 4)]
    pub max_attempts: u32,

    /// Backoff before the first retry; doubles on each further retry.
    #[arg(long, default_value_t = 500)]
    pub backoff_ms: u64,

    /// Per-request timeout.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Pages fetched concurrently (1-4). Writes stay sequential.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=4))]
    pub concurrency: u8,
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    /// Output directory of a previous `scrape`.
    #[arg(long, default_value = "data")]
    pub out: String,
}

#[derive(Debug, Clone, Args)]
pub struct ResetArgs {
    /// Output directory to clear.
    #[arg(long, default_value = "data")]
    pub out: String,
}
