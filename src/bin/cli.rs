use std::collections::HashSet;
use std::env;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use linedb::engine::config::DATA_DIR_ENV;
use linedb::engine::master::SLAVE_FIELD;
use linedb::engine::{MasterFactory, MasterRecord, RecordFile, Snapshot};
use linedb::query::Filter;
use serde_json::Value;

/// Inspect linedb record files without their schemas.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Number of records in a collection
    Count { collection: String },
    /// Pretty-print every record
    Dump { collection: String },
    /// Print the record with the given key
    Get { collection: String, key: String },
    /// Print records whose entity field equals a value
    Find { collection: String, field: String, value: String },
    /// Check that every line is a valid record with a unique key
    Verify { collection: String },
}

async fn open(data_dir: &str, collection: &str) -> anyhow::Result<Snapshot> {
    let file = RecordFile::new(data_dir, collection);
    if !file.exists().await? {
        bail!("collection {} not found in {}", collection, data_dir);
    }
    let scratch = file.snapshot().await.with_context(|| format!("copying {}", collection))?;
    Ok(Snapshot::open(scratch).await?)
}

fn print_record(line: &str) -> anyhow::Result<()> {
    let record = MasterRecord::from_line(line)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let data_dir = cli
        .data_dir
        .or_else(|| env::var(DATA_DIR_ENV).ok())
        .unwrap_or_else(|| "data".to_string());

    match cli.command {
        Commands::Count { collection } => {
            let mut lines = open(&data_dir, &collection).await?;
            let mut count = 0;
            while lines.next_line().await?.is_some() {
                count += 1;
            }
            println!("{}", count);
        }
        Commands::Dump { collection } => {
            let mut lines = open(&data_dir, &collection).await?;
            while let Some(line) = lines.next_line().await? {
                print_record(&line)?;
            }
        }
        Commands::Get { collection, key } => {
            let factory = MasterFactory::default();
            let mut lines = open(&data_dir, &collection).await?;
            while let Some(line) = lines.next_line().await? {
                if factory.line_key(&line)?.as_deref() == Some(key.as_str()) {
                    return print_record(&line);
                }
            }
            bail!("no record with key {} in {}", key, collection);
        }
        Commands::Find { collection, field, value } => {
            let value: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let filter = Filter::field_equals(vec![SLAVE_FIELD.to_string(), field], value);
            let mut lines = open(&data_dir, &collection).await?;
            while let Some(line) = lines.next_line().await? {
                if filter.matches_line(&line)? {
                    print_record(&line)?;
                }
            }
        }
        Commands::Verify { collection } => {
            let mut lines = open(&data_dir, &collection).await?;
            let mut seen = HashSet::new();
            let mut records = 0;
            let mut problems = 0;
            while let Some(line) = lines.next_line().await? {
                records += 1;
                match MasterRecord::from_line(&line) {
                    Ok(record) => {
                        if !seen.insert(record.key.clone()) {
                            println!("record {}: duplicate key {}", records, record.key);
                            problems += 1;
                        }
                    }
                    Err(e) => {
                        println!("record {}: {}", records, e);
                        problems += 1;
                    }
                }
            }
            if problems > 0 {
                bail!("{} problem(s) in {} record(s)", problems, records);
            }
            println!("OK: {} record(s)", records);
        }
    }

    Ok(())
}
