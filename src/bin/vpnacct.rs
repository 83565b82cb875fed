//! vpnacct - VPN Account CLI Tool
//!
//! Operator interface for VPN accounts: user administration, live session
//! status, forced disconnects, and one-shot expiry sweeps or credential
//! file resyncs.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use libvpnacct::*;
use libvpnacct::reconcile::today;
use libvpnacct::{status_log, validation};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "vpnacct")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "VPN account CLI - manage OpenVPN users across community and Access Server backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (default: /etc/vpnacct/vpnacct.toml if present)
    #[arg(short = 'C', long, global = true)]
    config: Option<PathBuf>,

    /// Terse output mode (colon separated fields)
    #[arg(short = 't', long, global = true)]
    terse: bool,

    /// JSON output
    #[arg(short = 'j', long, global = true, conflicts_with = "terse")]
    json: bool,

    /// Enable debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show live sessions on both backends
    Status {
        /// Read community sessions from the daemon's status log instead
        #[arg(long)]
        from_log: bool,
    },

    /// Drop every live session of a user
    Disconnect {
        username: String,
        /// Backend to act on (default: the user's backend, or both if unknown)
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Manage user records
    #[command(subcommand)]
    User(UserCommands),

    /// Run one expiry sweep
    Sweep {
        /// Evaluate expiry as of this date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Rebuild the credential file from the user records
    Sync {
        /// Evaluate expiry as of this date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// List user records
    List,

    /// Create a user
    Add {
        username: String,
        #[arg(long)]
        secret: String,
        /// Last day the account may connect (YYYY-MM-DD)
        #[arg(long)]
        expiry: NaiveDate,
        #[arg(long, default_value_t = 1)]
        max_connections: u32,
        #[arg(long, default_value = "community")]
        backend: BackendKind,
        /// Create the account disabled
        #[arg(long)]
        inactive: bool,
    },

    /// Change fields of an existing user
    Set {
        username: String,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        expiry: Option<NaiveDate>,
        #[arg(long)]
        max_connections: Option<u32>,
        /// Enable (true) or disable (false) the account
        #[arg(long)]
        active: Option<bool>,
    },

    /// Delete a user and withdraw its access everywhere
    Delete { username: String },

    /// Move a user to another backend
    Transfer { username: String, backend: BackendKind },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // No subcommand shows live status
    let default_command = Commands::Status { from_log: false };
    let command = cli.command.as_ref().unwrap_or(&default_command);

    if let Err(e) = run(command, &cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "warn" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("vpnacct={},libvpnacct={}", log_level, log_level))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

/// Stores and drivers built from the resolved configuration
struct Context {
    config: VpnAcctConfig,
    store: Arc<dyn UserStore>,
    reconciler: Arc<Reconciler>,
}

impl Context {
    fn new(cli: &Cli) -> VpnAcctResult<Self> {
        let config = VpnAcctConfig::resolve(cli.config.as_deref())?;
        let store: Arc<dyn UserStore> = Arc::new(FileUserStore::new(&config.paths.user_db));
        let reconciler = Arc::new(Reconciler::from_config(&config));
        Ok(Self {
            config,
            store,
            reconciler,
        })
    }

    fn service(&self) -> AccountService {
        AccountService::new(self.store.clone(), self.reconciler.clone())
    }
}

async fn run(command: &Commands, cli: &Cli) -> VpnAcctResult<()> {
    let ctx = Context::new(cli)?;
    let out = Output::new(cli);

    match command {
        Commands::Status { from_log } => handle_status(&ctx, &out, *from_log).await,
        Commands::Disconnect { username, backend } => {
            validation::validate_username(username)?;
            let backends = match backend {
                Some(backend) => vec![*backend],
                None => match ctx.store.get(username).await? {
                    Some(record) => vec![record.backend],
                    None => vec![BackendKind::Community, BackendKind::Commercial],
                },
            };

            let mut outcomes = Vec::new();
            for backend in backends {
                outcomes.extend(ctx.reconciler.disconnect(backend, username).await);
            }
            out.outcomes(&outcomes);
            Ok(())
        }
        Commands::User(cmd) => handle_user(cmd, &ctx, &out).await,
        Commands::Sweep { date } => {
            let sweeper = ExpirySweeper::new(ctx.store.clone(), ctx.reconciler.clone(), &ctx.config.sweeper);
            let report = sweeper.sweep(date.unwrap_or_else(today)).await?;
            if out.json {
                out.print_json(&report);
            } else {
                if !out.terse {
                    println!("Expired: {}", report.expired.len());
                }
                out.outcomes(&report.outcomes);
            }
            Ok(())
        }
        Commands::Sync { date } => {
            let resync = Resync::new(ctx.store.clone(), ctx.reconciler.clone());
            let report = resync.run(date.unwrap_or_else(today)).await?;
            if out.json {
                out.print_json(&report);
            } else {
                if !out.terse {
                    println!(
                        "Wrote {} credential entries to {}",
                        report.entries,
                        ctx.config.paths.credential_file.display()
                    );
                }
                out.outcomes(&report.outcomes);
            }
            Ok(())
        }
    }
}

async fn handle_status(ctx: &Context, out: &Output, from_log: bool) -> VpnAcctResult<()> {
    let snapshot = if from_log {
        let mut sessions = status_log::read(&ctx.config.paths.status_log).await?;
        sessions.extend(ctx.reconciler.list_sessions(BackendKind::Commercial).await);
        monitor::group(sessions)
    } else {
        SessionMonitor::new(ctx.reconciler.clone()).snapshot().await
    };

    if out.json {
        out.print_json(&snapshot);
        return Ok(());
    }

    if !out.terse {
        println!("{:<20} {:<11} {:<24} {}", "USER", "BACKEND", "REAL ADDRESS", "VIRTUAL ADDRESS");
    }
    for session in snapshot.values().flatten() {
        let real = session.real_address.as_deref().unwrap_or("-");
        let virt = session.virtual_address.as_deref().unwrap_or("-");
        if out.terse {
            println!("{}:{}:{}:{}", session.username, session.backend, real, virt);
        } else {
            println!("{:<20} {:<11} {:<24} {}", session.username, session.backend, real, virt);
        }
    }
    Ok(())
}

async fn handle_user(cmd: &UserCommands, ctx: &Context, out: &Output) -> VpnAcctResult<()> {
    let service = ctx.service();

    let outcomes = match cmd {
        UserCommands::List => {
            let users = service.list().await?;
            let today = today();
            if out.json {
                out.print_json(&users.iter().map(UserView::from).collect::<Vec<_>>());
                return Ok(());
            }
            if !out.terse {
                println!(
                    "{:<20} {:<11} {:<8} {:<12} {:<5} {}",
                    "USER", "BACKEND", "ACTIVE", "EXPIRES", "MAX", "STATE"
                );
            }
            for user in &users {
                let state = if user.is_intended_active(today) { "enabled" } else { "disabled" };
                if out.terse {
                    println!(
                        "{}:{}:{}:{}:{}:{}",
                        user.username, user.backend, user.is_active, user.expiry_date, user.max_connections, state
                    );
                } else {
                    println!(
                        "{:<20} {:<11} {:<8} {:<12} {:<5} {}",
                        user.username,
                        user.backend,
                        if user.is_active { "yes" } else { "no" },
                        user.expiry_date,
                        user.max_connections,
                        state
                    );
                }
            }
            return Ok(());
        }
        UserCommands::Add {
            username,
            secret,
            expiry,
            max_connections,
            backend,
            inactive,
        } => {
            let record = UserRecord::new(username.as_str(), secret.as_str(), *expiry)
                .with_max_connections(*max_connections)
                .with_backend(*backend)
                .with_active(!*inactive);
            service.create(record).await?
        }
        UserCommands::Set {
            username,
            secret,
            expiry,
            max_connections,
            active,
        } => {
            let mut record = service
                .store()
                .get(username)
                .await?
                .ok_or_else(|| VpnAcctError::NotFound(format!("User '{}'", username)))?;
            if let Some(secret) = secret {
                record.secret = secret.clone();
            }
            if let Some(expiry) = expiry {
                record.expiry_date = *expiry;
            }
            if let Some(max_connections) = max_connections {
                record.max_connections = *max_connections;
            }
            if let Some(active) = active {
                record.is_active = *active;
            }
            service.update(record).await?
        }
        UserCommands::Delete { username } => service.delete(username).await?,
        UserCommands::Transfer { username, backend } => service.transfer(username, *backend).await?,
    };

    out.outcomes(&outcomes);
    Ok(())
}

/// User record without its secret, for display
#[derive(Serialize)]
struct UserView<'a> {
    username: &'a str,
    backend: BackendKind,
    is_active: bool,
    expiry_date: NaiveDate,
    max_connections: u32,
}

impl<'a> From<&'a UserRecord> for UserView<'a> {
    fn from(record: &'a UserRecord) -> Self {
        Self {
            username: &record.username,
            backend: record.backend,
            is_active: record.is_active,
            expiry_date: record.expiry_date,
            max_connections: record.max_connections,
        }
    }
}

struct Output {
    terse: bool,
    json: bool,
}

impl Output {
    fn new(cli: &Cli) -> Self {
        Self {
            terse: cli.terse,
            json: cli.json,
        }
    }

    fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: failed to encode output: {}", e),
        }
    }

    fn outcomes(&self, outcomes: &[ReconciliationOutcome]) {
        if self.json {
            self.print_json(outcomes);
            return;
        }

        if outcomes.is_empty() && !self.terse {
            println!("Nothing to do");
        }
        for outcome in outcomes {
            if self.terse {
                println!(
                    "{}:{}:{}:{}:{}",
                    outcome.operation,
                    outcome.username,
                    outcome.backend,
                    if outcome.success { "ok" } else { "failed" },
                    outcome.error_detail.as_deref().unwrap_or("")
                );
            } else {
                println!("{}", outcome);
            }
        }
    }
}
