use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use speedwarden::api::AddressAllowList;
use speedwarden::directory::DirectoryClient;
use speedwarden::remote::DaemonClient;
use speedwarden::scheduler::{RunGate, ScheduleConfig, SqliteGate};
use speedwarden::service::SpeedService;
use speedwarden::storage::{self, MeasurementRecord, StateStore};

const DAEMON_TIMEOUT_SECS: u64 = 10;

#[derive(Parser)]
#[command(
    name = "speedwarden",
    about = "Scheduled and on-demand bandwidth measurements",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $SPEEDWARDEN_CONFIG, then /etc/speedwarden/speedwarden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + measurement schedule)
    Serve {
        /// Bind address, overrides [server] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one measurement now, subject to the cooldown and run gate
    Run {
        /// Measure against this server instead of the nearest one
        #[arg(long)]
        server_id: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show recent measurements, newest first
    History {
        #[arg(long, default_value = "10")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show or change the saved measurement schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// List candidate speedtest servers
    Servers {
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Clear a run lock left behind by a crashed process
    Unlock {
        /// Clear the lock even if its owner still appears to be running
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Show the saved schedule
    Show,

    /// Change the schedule (applied by the running daemon, or saved for its next start)
    Set {
        /// Seconds between measurements
        #[arg(long)]
        interval: u64,

        /// Pin scheduled runs to this server
        #[arg(long, conflicts_with = "any_server")]
        server_id: Option<u32>,

        /// Let the speedtest CLI pick the server
        #[arg(long)]
        any_server: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = speedwarden::load_config(cli.config.as_deref())?;
    speedwarden::init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting speedwarden daemon");
            speedwarden::serve(config).await?;
        }
        Commands::Run { server_id, json } => {
            let pool = storage::open_pool(&config.storage.database_path)?;
            let policy = AddressAllowList::default();
            let service = SpeedService::from_config(&config, pool, Arc::new(policy))?;

            tracing::info!(?server_id, "Running measurement");
            let record = service.trigger_manual(server_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_records(&[record]);
            }
        }
        Commands::History { limit, json } => {
            let pool = storage::open_pool(&config.storage.database_path)?;
            let records = StateStore::new(pool).list_recent(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No measurements recorded yet.");
            } else {
                print_records(&records);
            }
        }
        Commands::Schedule { action } => {
            let pool = storage::open_pool(&config.storage.database_path)?;
            let store = StateStore::new(pool.clone());

            match action {
                ScheduleAction::Show => match store.get_schedule()? {
                    Some(cfg) => println!(
                        "Every {}s, server: {}",
                        cfg.interval_secs,
                        describe_server(cfg.server_id)
                    ),
                    None => println!(
                        "No saved schedule; the daemon will use every {}s, server: any",
                        config.schedule.default_interval_secs
                    ),
                },
                ScheduleAction::Set {
                    interval,
                    server_id,
                    any_server,
                } => {
                    let server_id = if any_server {
                        None
                    } else if server_id.is_some() {
                        server_id
                    } else {
                        store.get_schedule()?.and_then(|cfg| cfg.server_id)
                    };
                    let cfg = ScheduleConfig {
                        interval_secs: interval,
                        server_id,
                    };

                    let daemon = DaemonClient::for_bind(
                        &config.server.bind,
                        Duration::from_secs(DAEMON_TIMEOUT_SECS),
                    )?;
                    match daemon.put_schedule(&cfg).await? {
                        Some(status) => {
                            println!(
                                "Schedule applied by the running daemon: every {}s, server: {}",
                                cfg.interval_secs,
                                describe_server(cfg.server_id)
                            );
                            if let Some(next) = status.next_run_at {
                                println!("Next run at {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
                            }
                        }
                        None => {
                            let policy = AddressAllowList::default();
                            let service = SpeedService::from_config(&config, pool, Arc::new(policy))?;
                            service.save_schedule(cfg).await?;
                            println!(
                                "Schedule saved: every {}s, server: {}",
                                cfg.interval_secs,
                                describe_server(cfg.server_id)
                            );
                            println!("No daemon is running; it applies on the next start.");
                        }
                    }
                }
            }
        }
        Commands::Servers { limit } => {
            let client = DirectoryClient::new(
                config.directory.url.clone(),
                Duration::from_secs(config.directory.timeout_secs),
            )?;
            let list = client.fetch(limit).await;
            if let Some(err) = &list.error {
                anyhow::bail!("server directory unavailable: {}", err);
            }
            println!("{:<8} | {:<30} | {:<20} | Country", "ID", "Sponsor", "Name");
            println!("{:-<8}-|-{:-<30}-|-{:-<20}-|-{:-<15}", "", "", "", "");
            for s in list.servers {
                println!("{:<8} | {:<30} | {:<20} | {}", s.id, s.sponsor, s.name, s.country);
            }
        }
        Commands::Unlock { force } => {
            let pool = storage::open_pool(&config.storage.database_path)?;
            let gate = SqliteGate::new(pool);
            let before = gate.status()?;
            if !before.held {
                println!("Run lock is not held.");
            } else if force {
                gate.force_release()?;
                println!("Run lock cleared (was held by pid {:?}).", before.owner_pid);
            } else if gate.reconcile()? {
                println!("Stale run lock cleared (owner pid {:?} is gone).", before.owner_pid);
            } else {
                println!(
                    "Run lock is held by running pid {:?}; use --force to clear it anyway.",
                    before.owner_pid
                );
            }
        }
    }

    Ok(())
}

fn describe_server(server_id: Option<u32>) -> String {
    server_id.map_or_else(|| "any".to_string(), |id| id.to_string())
}

fn print_records(records: &[MeasurementRecord]) {
    println!(
        "{:<20} | {:>10} | {:>10} | {:>9} | Server",
        "Time (UTC)", "Down Mbps", "Up Mbps", "Ping ms"
    );
    println!("{:-<20}-|-{:-<10}-|-{:-<10}-|-{:-<9}-|-{:-<20}", "", "", "", "", "");
    for r in records {
        println!(
            "{:<20} | {:>10.2} | {:>10.2} | {:>9.1} | {}",
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            r.download_mbps,
            r.upload_mbps,
            r.latency_ms,
            r.server_name.as_deref().unwrap_or("-")
        );
    }
}
