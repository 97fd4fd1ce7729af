use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use replicated_table::storage::restore_from;
use replicated_table::{DurabilityMode, PersistentStore};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "table-tool")]
#[command(about = "Offline inspection and maintenance of replicated table stores")]
struct Cli {
    /// File stem of the store files
    #[arg(long, global = true, default_value = "db")]
    stem: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every row of a table
    Dump {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        table: String,
        #[arg(long)]
        json: bool,
    },
    /// Print tables and row counts
    Stats {
        #[arg(long)]
        dir: PathBuf,
    },
    Backup {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    Restore {
        #[arg(long)]
        backup: PathBuf,
        #[arg(long)]
        dir: PathBuf,
    },
    /// Remove a table and its rows
    Drop {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        table: String,
    },
    /// Fold the WAL into the snapshot
    Compact {
        #[arg(long)]
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Dump { dir, table, json } => dump(&dir, &cli.stem, &table, json),
        Command::Stats { dir } => stats(&dir, &cli.stem),
        Command::Backup { dir, out } => {
            let store = open_store(&dir, &cli.stem)?;
            let manifest = store
                .backup_to(&out, &CancellationToken::new())
                .with_context(|| format!("Failed to back up '{}'", dir.display()))?;
            println!(
                "Backed up {} tables ({} rows, {} bytes) to {}",
                manifest.table_count,
                manifest.row_count,
                manifest.total_bytes(),
                out.display()
            );
            Ok(())
        }
        Command::Restore { backup, dir } => {
            let manifest = restore_from(&backup, &dir, &cli.stem, &CancellationToken::new())
                .with_context(|| format!("Failed to restore '{}'", backup.display()))?;
            println!(
                "Restored backup from {} ({} rows) into {}",
                manifest.created_at,
                manifest.row_count,
                dir.display()
            );
            Ok(())
        }
        Command::Drop { dir, table } => {
            let store = open_store(&dir, &cli.stem)?;
            store
                .drop_table(&table)
                .with_context(|| format!("Failed to drop table '{table}'"))?;
            println!("Dropped {table} from {}", dir.display());
            Ok(())
        }
        Command::Compact { dir } => {
            let store = open_store(&dir, &cli.stem)?;
            store.compact().context("Compaction failed")?;
            println!("Compacted {}", dir.display());
            Ok(())
        }
    }
}

fn open_store(dir: &Path, stem: &str) -> Result<PersistentStore> {
    if !dir.is_dir() {
        return Err(anyhow!("Store directory '{}' does not exist", dir.display()));
    }
    PersistentStore::open(dir, stem, DurabilityMode::Sync, usize::MAX)
        .with_context(|| format!("Failed to open store in '{}'", dir.display()))
}

fn dump(dir: &Path, stem: &str, table: &str, json: bool) -> Result<()> {
    let store = open_store(dir, stem)?;
    let mut after: Option<Vec<u8>> = None;
    let mut rows = Vec::new();
    while let Some((key, value)) = store.next_row(table, after.as_deref())? {
        after = Some(key.clone());
        rows.push((key, value));
    }

    if json {
        let entries: Vec<serde_json::Value> = rows
            .iter()
            .map(|(key, value)| {
                serde_json::json!({
                    "key": String::from_utf8_lossy(key),
                    "value": String::from_utf8_lossy(value),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for (key, value) in &rows {
            println!(
                "{}\t{}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            );
        }
        println!("({} rows)", rows.len());
    }
    Ok(())
}

fn stats(dir: &Path, stem: &str) -> Result<()> {
    let store = open_store(dir, stem)?;
    let tables = store.table_names()?;
    println!("Store: {} ({} tables)", dir.display(), tables.len());
    for table in tables {
        println!(
            "  {:<32} {:>10} rows  [{}]",
            table,
            store.row_count(&table)?,
            store.logical_name(&table)?
        );
    }
    Ok(())
}
