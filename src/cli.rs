//! Command line: run the validator, or read back what it stored.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use crate::core::Disposition;
use crate::db::SharedDatabase;
use crate::error::StoreError;

#[derive(Parser, Debug)]
#[command(name = "pattern-validator")]
#[command(about = "Adjudicates miner-submitted fraud patterns", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Adjudicate pattern responses from the configured source (default)
    Run,

    /// Query the pattern store
    Query {
        #[command(subcommand)]
        query: QueryCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum QueryCommand {
    /// One stored record by id
    Pattern { pattern_id: String },

    /// Every record sharing a canonical pattern hash, in arrival order
    Hash { pattern_hash: String },

    /// A miner's most recent records
    Miner {
        hotkey: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Most recent records with one disposition
    Disposition {
        #[arg(value_parser = parse_disposition)]
        disposition: Disposition,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Number of stored records
    Count,

    /// Totals by disposition, duplicates and mean score
    Stats,
}

fn parse_disposition(name: &str) -> Result<Disposition, String> {
    serde_json::from_value(Value::String(name.to_ascii_lowercase()))
        .map_err(|_| format!("unknown disposition '{name}'"))
}

/// Answers a query as JSON.
pub fn run_query(db: &SharedDatabase, query: &QueryCommand) -> Result<Value, StoreError> {
    let value = match query {
        QueryCommand::Pattern { pattern_id } => serde_json::to_value(db.get_pattern(pattern_id)?)?,
        QueryCommand::Hash { pattern_hash } => serde_json::to_value(db.get_patterns_by_hash(pattern_hash)?)?,
        QueryCommand::Miner { hotkey, limit } => serde_json::to_value(db.get_patterns_by_miner(hotkey, *limit)?)?,
        QueryCommand::Disposition { disposition, limit } => {
            serde_json::to_value(db.get_patterns_by_disposition(*disposition, *limit)?)?
        }
        QueryCommand::Count => json!({ "patterns": db.get_pattern_count()? }),
        QueryCommand::Stats => serde_json::to_value(db.get_statistics()?)?,
    };
    Ok(value)
}
