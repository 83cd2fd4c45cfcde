//! presenced - Systemd user daemon for automatic away and connectivity-aware presence.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use futures_util::StreamExt;
use presenced::backend::MissionControl;
use presenced::backend::PresenceBackend;
use presenced::config::Config;
use presenced::config::IdleBackend;
use presenced::connectivity::Connectivity;
use presenced::connectivity::NetworkMonitor;
use presenced::control;
use presenced::coordinator::Coordinator;
use presenced::coordinator::CoordinatorOptions;
use presenced::coordinator::PresenceEvent;
use presenced::coordinator::query_initial_presence;
use presenced::idle::GnomeSessionSource;
use presenced::idle::IdleSource;
use presenced::idle::LogindSource;
use presenced::service::Input;
use presenced::service::Service;
use presenced::service::forward_requests;
use presenced::service::idle_inputs;
use presenced::service::spawn_pump;
use tokio::signal::unix::SignalKind;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use zbus::Connection;

/// Presence daemon for Telepathy Mission Control.
///
/// Sets the IM presence to away when the session is idle, and to offline
/// while the network is down.
#[derive(Parser, Debug)]
#[command(name = "presenced")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print presence property changes to stdout as JSON lines.
    #[arg(long)]
    print_events: bool,

    /// Don't go away when the session is idle.
    #[arg(long)]
    no_auto_away: bool,

    /// Seconds idle before away escalates to extended away.
    #[arg(long)]
    ext_away_delay: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level)?;

    info!("presenced v{} starting", env!("CARGO_PKG_VERSION"));

    // Load config
    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    if args.no_auto_away {
        config.auto_away = false;
    }
    if let Some(delay) = args.ext_away_delay {
        config.ext_away_delay_seconds = delay;
    }

    info!(
        "Configuration loaded (auto_away={}, idle_backend={:?}, use_connectivity={})",
        config.auto_away, config.idle_backend, config.use_connectivity
    );

    run_daemon(config, args.print_events).await
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("presenced={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Run daemon until SIGINT or SIGTERM.
async fn run_daemon(config: Config, print_events: bool) -> Result<()> {
    let session = Connection::session()
        .await
        .context("Failed to connect to session DBus")?;

    // The system bus only carries optional inputs
    let system = match Connection::system().await {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!("Failed to connect to system DBus: {}", e);
            None
        }
    };

    let backend: Arc<dyn PresenceBackend> = Arc::new(
        MissionControl::connect(&session)
            .await
            .context("Failed to create Mission Control proxy")?,
    );
    let initial = query_initial_presence(backend.as_ref()).await;
    info!(
        "Initial presence: {} ({})",
        initial.kind,
        initial.status_or_default()
    );

    let network = match &system {
        Some(conn) => match NetworkMonitor::connect(conn).await {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!("NetworkManager unavailable: {}. Assuming connected.", e);
                None
            }
        },
        None => None,
    };
    let connected = match &network {
        Some(monitor) => monitor.is_connected().await.unwrap_or_else(|e| {
            warn!("Failed to read NetworkManager state: {}. Assuming connected.", e);
            true
        }),
        None => true,
    };

    // Initialize components
    let (coordinator, requests) = Coordinator::new(
        initial,
        Connectivity::new(config.use_connectivity, connected),
        &CoordinatorOptions::from(&config),
    );
    let (service, handle) = Service::new(coordinator);
    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let forwarder = tokio::spawn(forward_requests(backend.clone(), requests));

    match backend.presence_changes().await {
        Ok(changes) => tasks.push(spawn_pump(
            "presence",
            changes.map(Input::PresenceChanged),
            handle.sender(),
            cancel.clone(),
        )),
        Err(e) => warn!("Failed to follow Mission Control presence: {}", e),
    }

    if let Some(source) = open_idle_source(&config, &session, system.as_ref()).await {
        tasks.push(spawn_pump(
            "idle",
            idle_inputs(source),
            handle.sender(),
            cancel.clone(),
        ));
    }

    if let Some(monitor) = network {
        tasks.push(spawn_pump(
            "network",
            monitor.into_stream().map(Input::NetworkChanged),
            handle.sender(),
            cancel.clone(),
        ));
    }

    if config.control_interface {
        match control::serve(&session, &handle, cancel.clone()).await {
            Ok(task) => tasks.push(task),
            Err(e) => warn!("Control interface unavailable: {}", e),
        }
    }

    if print_events {
        tasks.push(spawn_event_printer(handle.subscribe(), cancel.clone()));
    }

    let mut service_task = tokio::spawn(service.run(cancel.clone()));
    info!("Daemon started, waiting for presence events...");

    tokio::select! {
        result = wait_for_shutdown() => result?,
        result = &mut service_task => {
            result.context("Presence service failed")?;
            anyhow::bail!("Presence service stopped unexpectedly");
        }
    }

    info!("Shutting down");
    cancel.cancel();
    service_task.await.context("Presence service failed")?;

    // The coordinator is gone, so the forwarder drains what's left and ends
    if let Err(e) = forwarder.await {
        error!("Presence forwarder failed: {}", e);
    }
    for task in tasks {
        task.abort();
    }

    Ok(())
}

/// Open the configured idle source. Failures disable auto-away on idle.
async fn open_idle_source(
    config: &Config,
    session: &Connection,
    system: Option<&Connection>,
) -> Option<Box<dyn IdleSource>> {
    match config.idle_backend {
        IdleBackend::None => {
            info!("Idle detection disabled");
            None
        }
        IdleBackend::Gnome => match GnomeSessionSource::connect(session).await {
            Ok(source) => Some(Box::new(source)),
            Err(e) => {
                warn!(
                    "GNOME session presence unavailable: {}. Auto-away on idle disabled.",
                    e
                );
                None
            }
        },
        IdleBackend::Logind => {
            let Some(conn) = system else {
                warn!("No system DBus for logind. Auto-away on idle disabled.");
                return None;
            };
            match LogindSource::connect(conn, config.idle_check_interval()).await {
                Ok(source) => Some(Box::new(source)),
                Err(e) => {
                    error!(
                        "Failed to initialize logind idle source: {}. Auto-away on idle disabled.",
                        e
                    );
                    None
                }
            }
        }
    }
}

/// Print presence events as JSON lines.
fn spawn_event_printer(
    mut events: broadcast::Receiver<PresenceEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = events.recv() => match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("[PRESENCE] | {line}"),
                        Err(e) => warn!("Failed to encode presence event: {}", e),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Skipped {} presence events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }

    Ok(())
}
