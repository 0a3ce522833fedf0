use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::time::Duration;
use stridepoint::{
    app::App,
    config::{Config, StorageBackend},
    db::SqliteTrackStore,
    events::{Event, EventHandler},
    logging,
    models::UserId,
    store::{MemoryTrackStore, TrackStore},
};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "stridepoint", about = "GPS activity scoring and rank tiers")]
struct Cli {
    /// Config file (defaults to $STRIDEPOINT_CONFIG or ./config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Read JSON fixes from stdin, one per line, and print one JSON response per fix
    Ingest,
    /// Print a user's points, tier and position
    Standing { user_id: UserId },
    /// Print a user's cumulative distance, steps and points
    Totals { user_id: UserId },
    /// Write a user's stored track to stdout as CSV
    Export { user_id: UserId },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = Config::load(cli.config.unwrap_or_else(Config::default_path))?;
    let _log_guard = logging::initialize_logging(&config.logging);
    let command = cli.command.unwrap_or(Command::Ingest);

    match config.storage.backend {
        StorageBackend::Sqlite => {
            let store = SqliteTrackStore::open(
                &config.storage.database_path,
                Duration::from_millis(config.storage.busy_timeout_ms),
            )?;
            info!("Using sqlite store at {}", config.storage.database_path.display());
            execute(App::new(&config, store), command).await
        }
        StorageBackend::Memory => {
            info!("Using in-memory store; nothing will persist.");
            execute(App::new(&config, MemoryTrackStore::new()), command).await
        }
    }
}

async fn execute<S: TrackStore>(app: App<S>, command: Command) -> Result<()> {
    match command {
        Command::Ingest => ingest(app).await,
        Command::Standing { user_id } => {
            println!("{}", serde_json::to_string(&app.standing(user_id).await?)?);
            Ok(())
        }
        Command::Totals { user_id } => {
            println!("{}", serde_json::to_string(&app.totals(user_id).await?)?);
            Ok(())
        }
        Command::Export { user_id } => {
            let rows = app.export_track(user_id, std::io::stdout().lock()).await?;
            info!("Exported {} samples for user {}", rows, user_id);
            Ok(())
        }
    }
}

/// Every fix is handled on its own task; responses are printed as they complete.
async fn ingest<S: TrackStore>(app: App<S>) -> Result<()> {
    let mut events = EventHandler::stdin();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        stdout.flush().await
    });

    let mut tasks = JoinSet::new();
    while let Some(event) = events.next().await {
        match event {
            Event::Location(location) => {
                let app = app.clone();
                let out = out_tx.clone();
                tasks.spawn(async move {
                    let user_id = location.user_id;
                    let line = match app.handle_location(location).await {
                        Ok(response) => serde_json::to_string(&response)?,
                        Err(e) => {
                            error!("Ingestion failed for user {}: {}", user_id, e);
                            serde_json::json!({
                                "user_id": user_id,
                                "error": e.to_string(),
                                "retriable": true,
                            })
                            .to_string()
                        }
                    };
                    out.send(line).ok();
                    Ok::<_, serde_json::Error>(())
                });
            }
            Event::Malformed { line_no, error } => {
                warn!("Input line {} ignored", line_no);
                let line = serde_json::json!({ "line": line_no, "error": error }).to_string();
                out_tx.send(line).ok();
            }
            Event::Eof => break,
        }
    }

    while let Some(joined) = tasks.join_next().await {
        joined??;
    }
    drop(out_tx);
    writer.await??;
    info!("Input closed, shutting down.");
    Ok(())
}
