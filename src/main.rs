use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dx_relay::config::{LoggingConfig, RelayConfig};
use dx_relay::storage::{self, Database, MIGRATIONS};
use dx_relay::sync::{HttpTransport, PollClient, RecordingHost};
use dx_relay::{AppType, HealthMonitor, Relay};

#[derive(Parser)]
#[command(name = "dx-relay")]
#[command(about = "Durable update relay and connection sync engine", version)]
#[command(after_help = "Relay Features:
- Pairs a source locator (e.g. a cell) with a target locator (e.g. a slide element)
- Relays selection and value changes through a durable SQLite queue
- Adaptive polling clients with backoff and bounded reconnects
- Health snapshots and a background reaper for aged rows")]
struct Cli {
    /// Directory containing `.dx/relay`
    #[arg(short, long, default_value = ".", global = true)]
    path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the relay directory, store and default config
    Init,

    /// Start the relay HTTP server
    Serve {
        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,
    },

    /// Apply pending schema migrations
    Migrate,

    /// Print a health snapshot
    Health {
        /// Emit JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Delete aged processed updates, sync rows and error logs
    Reap {
        /// Retention window in minutes (defaults to the configured value)
        #[arg(short, long)]
        retention: Option<i64>,
    },

    /// Run a poll client against a relay server
    Poll {
        /// API root, e.g. http://127.0.0.1:3000/api
        #[arg(short, long, default_value = "http://127.0.0.1:3000/api")]
        url: String,

        /// Audience to poll for: source-app or target-app
        #[arg(short, long)]
        app: AppType,

        #[arg(short, long)]
        instance: Option<String>,
    },

    /// List active connections that have not synced recently
    Stale {
        /// Threshold in minutes (defaults to the configured value)
        #[arg(short, long)]
        minutes: Option<i64>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let relay_path = storage::relay_dir(&cli.path);
    let config = RelayConfig::load(&relay_path)?;
    let _guard = init_logging(&config.logging, &relay_path);

    match cli.command {
        Commands::Init => {
            println!("{}", "🚀 Initializing relay...".cyan().bold());
            let relay_path = storage::init(&cli.path).await?;
            println!(
                "{} Relay initialized at {}",
                "✓".green(),
                relay_path.display().to_string().bright_white()
            );
            println!("\n{}", "Next steps:".yellow());
            println!("  1. {} - Start the relay", "dx-relay serve".bright_white());
            println!(
                "  2. {} - Attach a client",
                "dx-relay poll --app target-app".bright_white()
            );
        }

        Commands::Serve { port, host } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            println!(
                "{}",
                format!("🌐 Starting relay on port {}...", config.server.port)
                    .cyan()
                    .bold()
            );
            dx_relay::server::serve(config, &relay_path).await?;
        }

        Commands::Migrate => {
            let db = open_database(&config, &relay_path)?;
            let before = db.schema_version()?;
            db.initialize().context("migration failed")?;
            let after = db.schema_version()?;
            if before == after {
                println!("{} Schema is current (version {})", "✓".green(), after);
            } else {
                println!(
                    "{} Migrated schema {} → {} ({} known migrations)",
                    "✓".green(),
                    before,
                    after.to_string().bright_yellow(),
                    MIGRATIONS.len()
                );
            }
        }

        Commands::Health { json } => {
            let monitor = open_monitor(&config, &relay_path)?;
            let snapshot = tokio::task::spawn_blocking(move || monitor.snapshot()).await??;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                let status = if snapshot.is_healthy() {
                    "healthy".green()
                } else {
                    "degraded".yellow()
                };
                println!("{} Relay is {}", "●".bright_blue(), status);
                println!("  active connections: {}", snapshot.active_connections);
                println!("  pending updates:    {}", snapshot.pending_updates);
                println!("  errors (1h):        {}", snapshot.errors_last_hour);
                println!("  stale connections:  {}", snapshot.stale_connections);
                match snapshot.mean_sync_latency_ms {
                    Some(ms) => println!("  mean sync latency:  {ms:.0} ms"),
                    None => println!("  mean sync latency:  {}", "n/a".bright_black()),
                }
                for warning in &snapshot.warnings {
                    println!("  {} {:?}", "⚠".yellow(), warning);
                }
            }
        }

        Commands::Reap { retention } => {
            let monitor = open_monitor(&config, &relay_path)?;
            let retention = retention.unwrap_or(config.health.retention_minutes);
            let report = tokio::task::spawn_blocking(move || monitor.reap(retention)).await?;
            println!(
                "{} Reaped {} updates, {} sync rows, {} error logs",
                "✓".green(),
                report.updates,
                report.sync_statuses,
                report.error_logs
            );
        }

        Commands::Poll { url, app, instance } => {
            let transport = HttpTransport::new(&url, config.poll.request_timeout())?;
            println!(
                "{} Polling {} as {}",
                "↔".bright_blue(),
                url.bright_white(),
                app.to_string().bright_yellow()
            );
            let client = PollClient::new(
                app,
                instance,
                Arc::new(transport),
                Arc::new(RecordingHost::new()),
                config.poll.clone(),
            );

            let (auto_update, receiver) = watch::channel(true);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    auto_update.send_replace(false);
                }
            });

            let ctx = client.run(receiver).await?;
            println!(
                "{} Poll client stopped (last update {})",
                "✓".green(),
                ctx.last_update
                    .map(|ms| ms.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
        }

        Commands::Stale { minutes } => {
            let relay = Relay::open(&relay_path, &config)?;
            let minutes = minutes.unwrap_or(config.health.stale_connection_minutes);
            let stale = relay.registry().list_stale(minutes)?;
            if stale.is_empty() {
                println!("{} No stale connections", "✓".green());
            }
            for connection in stale {
                let last_sync = connection
                    .last_sync_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{} {} {} → {} (last sync {})",
                    "⚠".yellow(),
                    connection.id.bright_black(),
                    connection.source_ref.bright_white(),
                    connection.target_ref.bright_white(),
                    last_sync
                );
            }
        }
    }

    Ok(())
}

fn open_database(config: &RelayConfig, relay_path: &Path) -> Result<Database> {
    let db_path = config.db_path(relay_path);
    Database::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))
}

fn open_monitor(config: &RelayConfig, relay_path: &Path) -> Result<HealthMonitor> {
    let db = open_database(config, relay_path)?;
    db.initialize().context("migration failed")?;
    Ok(HealthMonitor::new(Arc::new(db), config.health.clone()))
}

/// Console logging filtered by `RUST_LOG` (or the configured filter), plus a
/// daily rolling file under `logs/` when enabled. The guard must outlive
/// `main` for the file writer to flush.
fn init_logging(config: &LoggingConfig, relay_path: &Path) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("dx_relay=info"));

    let (file_layer, guard) = if config.file {
        let appender = tracing_appender::rolling::daily(relay_path.join("logs"), "relay.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
