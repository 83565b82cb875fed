//! VPN Account Daemon (vpnacctd)
//!
//! Runs the expiry sweeper on a fixed interval so expired accounts lose
//! access without operator action.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (reads /etc/vpnacct/vpnacct.toml if present)
//! sudo vpnacctd
//!
//! # Custom configuration, verbose logging
//! sudo vpnacctd --config /srv/vpnacct.toml --verbose
//!
//! # Single sweep for use from cron or a systemd timer
//! sudo vpnacctd --once
//! ```
//!
//! SIGTERM and SIGINT stop the daemon after the current pass. SIGHUP
//! rebuilds the credential file from the user records.

use anyhow::Context;
use clap::Parser;
use libvpnacct::reconcile::today;
use libvpnacct::{ExpirySweeper, FileUserStore, Reconciler, Resync, UserStore, VpnAcctConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// VPN Account Daemon
#[derive(Parser, Debug)]
#[command(name = "vpnacctd")]
#[command(version)]
#[command(about = "VPN Account Daemon - periodically revokes expired VPN accounts", long_about = None)]
struct Args {
    /// Configuration file (default: /etc/vpnacct/vpnacct.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Stop,
    Resync,
}

/// Shared state for signal handling
struct DaemonState {
    running: RwLock<bool>,
    resync_pending: RwLock<bool>,
    wake: Notify,
}

impl DaemonState {
    fn new() -> Self {
        Self {
            running: RwLock::new(true),
            resync_pending: RwLock::new(false),
            wake: Notify::new(),
        }
    }

    async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    async fn request(&self, request: Request) {
        match request {
            Request::Stop => {
                *self.running.write().await = false;
                info!("Daemon stop requested");
            }
            Request::Resync => {
                *self.resync_pending.write().await = true;
                info!("Credential file resync requested");
            }
        }
        self.wake.notify_one();
    }

    async fn take_resync(&self) -> bool {
        std::mem::replace(&mut *self.resync_pending.write().await, false)
    }
}

/// Everything one sweep or resync needs
struct Daemon {
    sweeper: ExpirySweeper,
    resync: Resync,
}

impl Daemon {
    fn new(config: &VpnAcctConfig) -> Self {
        let store: Arc<dyn UserStore> = Arc::new(FileUserStore::new(&config.paths.user_db));
        let reconciler = Arc::new(Reconciler::from_config(config));
        Self {
            sweeper: ExpirySweeper::new(store.clone(), reconciler.clone(), &config.sweeper),
            resync: Resync::new(store, reconciler),
        }
    }

    async fn sweep(&self) {
        match self.sweeper.sweep(today()).await {
            Ok(report) => {
                for failure in report.failures() {
                    warn!("{}", failure);
                }
            }
            Err(e) => error!("Sweep failed: {}", e),
        }
    }

    async fn resync(&self) {
        if let Err(e) = self.resync.run(today()).await {
            error!("Resync failed: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting VPN Account Daemon (vpnacctd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = VpnAcctConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;

    // Check if running as root
    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - writing {:?} may fail", config.paths.credential_file);
        }
    }

    let daemon = Daemon::new(&config);

    if args.once {
        daemon.sweep().await;
        return Ok(());
    }

    let state = Arc::new(DaemonState::new());
    let state_clone = state.clone();

    tokio::spawn(async move {
        if let Err(e) = handle_signals(state_clone).await {
            error!("Signal handler error: {:#}", e);
        }
    });

    info!(
        "Sweeping every {}s; credential file {:?}; user database {:?}",
        config.sweeper.interval_secs, config.paths.credential_file, config.paths.user_db
    );

    let mut ticker = tokio::time::interval(config.sweeper.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while state.is_running().await {
        tokio::select! {
            _ = ticker.tick() => daemon.sweep().await,
            _ = state.wake.notified() => {
                if state.take_resync().await {
                    daemon.resync().await;
                }
            }
        }
    }

    info!("VPN Account Daemon stopped");
    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("vpnacctd={},libvpnacct={}", log_level, log_level))
        });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Handle Unix signals until a stop is requested
async fn handle_signals(state: Arc<DaemonState>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

    loop {
        let request = tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                Request::Stop
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                Request::Stop
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, resyncing credential file");
                Request::Resync
            }
        };

        state.request(request).await;
        if request == Request::Stop {
            return Ok(());
        }
    }
}
