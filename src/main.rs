use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ledgerline::identity::StoreHandle;
use ledgerline::remote::http::HttpRemote;
use ledgerline::remote::memory::MemoryRemote;
use ledgerline::remote::RemoteApi;
use ledgerline::{SyncConfig, SyncService};

#[derive(Debug, Parser)]
#[command(name = "ledgerline", about = "Ledgerline sync maintenance tool", version)]
struct Cli {
    /// Database file; defaults to the platform data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Remote service base URL; falls back to LEDGERLINE_API_URL.
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Bearer token; falls back to LEDGERLINE_API_TOKEN.
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print cache, queue and quarantine counts.
    Status {
        /// Emit the raw JSON summary instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Inspect and manage the mutation queue.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Inspect payloads that failed integrity checks during sync.
    #[command(subcommand)]
    Quarantine(QuarantineCommand),
    /// Run the sync engines against the configured remote.
    #[command(subcommand)]
    Sync(SyncCommand),
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// List terminally failed mutations.
    ListFailed,
    /// Drop terminally failed mutations.
    ClearFailed,
    /// Drop the entire queue, pending items included.
    ClearAll,
}

#[derive(Debug, Subcommand)]
enum QuarantineCommand {
    /// List quarantined payloads.
    List,
    /// Drop all quarantined payloads.
    Clear,
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    /// Drain the outgoing mutation queue once.
    Out,
    /// Run a full pull-and-reconcile.
    In,
    /// Drain the queue, then pull.
    Full,
}

fn main() {
    ledgerline::logging::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<i32> {
    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path().context("determine database path")?,
    };
    let marker_path = db_path.with_file_name("sync-marker.json");
    let marker = StoreHandle::file(&marker_path).context("open identity marker store")?;
    let remote = build_remote(&cli)?;

    let service = SyncService::open(&db_path, remote, marker.clone(), cli_config())
        .await
        .context("open sync service")?;

    match cli.command {
        Commands::Status { json } => {
            let summary = ledgerline::diagnostics::gather(service.pool(), &marker).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("identity:    {}", summary.identity.as_deref().unwrap_or("-"));
                for entity in &summary.entities {
                    println!("{:<20} {}", entity.entity_type, entity.cached);
                }
                println!("queue pending: {}", summary.queue_pending);
                println!("queue failed:  {}", summary.queue_failed);
                println!("quarantined:   {}", summary.quarantined);
            }
            Ok(0)
        }
        Commands::Queue(cmd) => match cmd {
            QueueCommand::ListFailed => {
                let failed = service.list_failed_mutations().await?;
                if failed.is_empty() {
                    println!("no failed mutations");
                } else {
                    for item in failed {
                        println!(
                            "#{} {}:{} {} attempts={} error={}",
                            item.id,
                            item.entity_type.as_str(),
                            item.action.as_str(),
                            item.entity_id,
                            item.attempts,
                            item.last_error.as_deref().unwrap_or("-")
                        );
                    }
                }
                Ok(0)
            }
            QueueCommand::ClearFailed => {
                service.clear_failed_mutations().await?;
                println!("failed mutations cleared");
                Ok(0)
            }
            QueueCommand::ClearAll => {
                service.clear_all_mutations().await?;
                println!("mutation queue cleared");
                Ok(0)
            }
        },
        Commands::Quarantine(cmd) => match cmd {
            QuarantineCommand::List => {
                let rows = ledgerline::store::list_quarantine(service.pool()).await?;
                if rows.is_empty() {
                    println!("quarantine is empty");
                } else {
                    for row in rows {
                        println!(
                            "#{} {} {} reason={} payload={}",
                            row.id,
                            row.entity_type,
                            row.external_id.as_deref().unwrap_or("-"),
                            row.reason,
                            row.payload
                        );
                    }
                }
                Ok(0)
            }
            QuarantineCommand::Clear => {
                ledgerline::store::clear_quarantine(service.pool()).await?;
                println!("quarantine cleared");
                Ok(0)
            }
        },
        Commands::Sync(cmd) => {
            match cmd {
                SyncCommand::Out => {
                    let outcome = service.run_outbound_sync().await;
                    println!("outbound: {outcome:?}");
                }
                SyncCommand::In => {
                    let outcome = service.run_inbound_sync().await;
                    println!("inbound: {outcome:?}");
                }
                SyncCommand::Full => {
                    let out = service.run_outbound_sync().await;
                    println!("outbound: {out:?}");
                    let inb = service.run_inbound_sync().await;
                    println!("inbound: {inb:?}");
                }
            }
            Ok(0)
        }
    }
}

fn cli_config() -> SyncConfig {
    SyncConfig {
        // The CLI drives the engines explicitly.
        auto_flush: false,
        ..SyncConfig::default()
    }
}

fn build_remote(cli: &Cli) -> Result<Arc<dyn RemoteApi>> {
    let url = cli
        .api_url
        .clone()
        .or_else(|| std::env::var("LEDGERLINE_API_URL").ok());
    match url {
        Some(url) => {
            let token = cli
                .token
                .clone()
                .or_else(|| std::env::var("LEDGERLINE_API_TOKEN").ok());
            Ok(Arc::new(
                HttpRemote::new(url, token).context("build remote client")?,
            ))
        }
        // Queue/status commands work fully offline; sync commands against
        // the in-memory remote are a dry run.
        None => Ok(Arc::new(MemoryRemote::new(None))),
    }
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("no platform data directory")?;
    Ok(base.join("ledgerline").join("ledgerline.sqlite3"))
}
