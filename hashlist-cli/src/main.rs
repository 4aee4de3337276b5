#![deny(unsafe_code)]
//! `hashlist` - writes the sorted hash list of an ID range

use anyhow::{Context, Result, bail};
use clap::Parser;
use env_logger::Env;
use hashlist_core::config::{
    DEFAULT_MEMORY_BUDGET, DEFAULT_PROGRESS_INTERVAL, DEFAULT_QUEUE_CAPACITY, DEFAULT_THREADS,
};
use hashlist_core::{ExternalSort, Order, SortConfig, check_order};
use log::info;
use std::path::PathBuf;

/// Generate the MD5 record of every ID in a range and write them sorted by
/// their last six bytes.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// First ID, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_id)]
    start: u64,

    /// Last ID (inclusive), decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_id)]
    end: u64,

    /// Worker threads
    #[arg(short = 't', long, default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Bytes of records held in memory per block
    #[arg(short = 'm', long, default_value_t = DEFAULT_MEMORY_BUDGET)]
    memory: u64,

    /// Output file
    #[arg(short = 'o', long, default_value = "list")]
    output: PathBuf,

    /// Prefix for segment files [default: the output path]
    #[arg(long)]
    segment_prefix: Option<PathBuf>,

    /// Records written between progress messages
    #[arg(long, default_value_t = DEFAULT_PROGRESS_INTERVAL)]
    progress_interval: u64,

    /// Capacity of the final merge queue, in records
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Check the output is sorted after the run
    #[arg(long)]
    verify: bool,
}

impl Args {
    fn to_config(&self) -> SortConfig {
        let config = SortConfig::new(self.start, self.end, &self.output)
            .with_threads(self.threads)
            .with_memory_budget(self.memory)
            .with_progress_interval(self.progress_interval)
            .with_queue_capacity(self.queue_capacity);

        match &self.segment_prefix {
            Some(prefix) => config.with_segment_prefix(prefix),
            None => config,
        }
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal ID
fn parse_id(value: &str) -> Result<u64> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => value.replace('_', "").parse::<u64>(),
    };
    parsed.with_context(|| format!("Invalid ID '{value}'"))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    info!("Running hashlist version {}", env!("CARGO_PKG_VERSION"));
    let sort = ExternalSort::new(args.to_config())?;
    let summary = sort.run()?;
    let output = &sort.config().output;

    info!(
        "Wrote {} records from {} blocks to {} in {:.2?}",
        summary.records,
        summary.blocks,
        output.display(),
        summary.elapsed
    );

    if args.verify {
        let report = check_order(output, Order::Ascending)?;
        if let Some(index) = report.first_violation {
            bail!("{} is not sorted: record {index} is out of order", output.display());
        }
        info!("Verified {} records in ascending order", report.records);
    }

    Ok(())
}
