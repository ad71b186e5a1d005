//! Operator CLI over the notekeep persistence core.
//!
//! # Responsibility
//! - Run the startup check and the note use-cases against a data directory.
//! - Keep output plain and line-oriented for scripts.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notekeep_core::{NoteService, RecordStore, StoreConfig, StoreHealth};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

#[derive(Parser)]
#[command(name = "notekeep")]
#[command(version, about = "Manage a notekeep JSON note store", long_about = None)]
struct Cli {
    /// Directory holding notes.json and its backups.
    #[arg(long, global = true, env = "NOTEKEEP_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Write rolling logs into this directory.
    #[arg(long, global = true, env = "NOTEKEEP_LOG_DIR")]
    log_dir: Option<String>,

    /// Log level (trace|debug|info|warn|error).
    #[arg(long, global = true, env = "NOTEKEEP_LOG_LEVEL")]
    log_level: Option<String>,

    /// Keep at most this many backup snapshots.
    #[arg(long, global = true)]
    max_snapshots: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create directories and validate or repair the note file.
    Init,
    /// Print all notes as `id<TAB>title<TAB>text`.
    List,
    /// Create one note and print its id.
    Add {
        #[arg(short, long, default_value = "")]
        title: String,
        #[arg(short = 'x', long, default_value = "")]
        text: String,
    },
    /// Delete one note and redact it from backups.
    Delete { id: String },
    /// List backup snapshots, newest first.
    Backups,
    /// Replace the note file with the newest usable snapshot.
    Restore,
    /// Print the core version.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(log_dir) = cli.log_dir.as_deref() {
        let level = cli
            .log_level
            .as_deref()
            .unwrap_or(notekeep_core::default_log_level());
        notekeep_core::init_logging(level, log_dir)
            .map_err(anyhow::Error::msg)
            .context("failed to initialize logging")?;
    }

    if let Command::Version = cli.command {
        println!("notekeep_core version={}", notekeep_core::core_version());
        return Ok(());
    }

    let config = StoreConfig::new(&cli.data_dir).with_max_snapshots(cli.max_snapshots);
    let store = RecordStore::open(config).context("invalid store configuration")?;
    let health = store
        .ensure_store()
        .await
        .with_context(|| format!("failed to prepare store in {}", cli.data_dir.display()))?;
    let service = NoteService::new(store.clone());

    match cli.command {
        Command::Init => print_health(&health),
        Command::List => {
            for note in service.list_notes().await? {
                println!("{}\t{}\t{}", note.id, note.title, note.text);
            }
        }
        Command::Add { title, text } => {
            let note = service.create_note(title, text).await?;
            println!("{}", note.id);
        }
        Command::Delete { id } => {
            let note = service.delete_note(&id).await?;
            println!("deleted {}", note.id);
        }
        Command::Backups => {
            for snapshot in store.snapshots().await {
                let modified_ms = snapshot
                    .modified
                    .duration_since(UNIX_EPOCH)
                    .map(|age| age.as_millis())
                    .unwrap_or_default();
                println!("{}\t{}", modified_ms, snapshot.path.display());
            }
        }
        Command::Restore => {
            let source = store.restore_latest().await?;
            println!("restored from {}", source.display());
        }
        Command::Version => {}
    }

    Ok(())
}

fn print_health(health: &StoreHealth) {
    match health {
        StoreHealth::Restored { from } => {
            println!("{} from {}", health.as_str(), from.display());
        }
        StoreHealth::ResetEmpty {
            quarantined: Some(path),
        } => {
            println!("{} quarantined {}", health.as_str(), path.display());
        }
        _ => println!("{}", health.as_str()),
    }
}
