// companion: connects to a Calibre desktop and serves one sync session.

use clap::Parser;
use companion::config;
use companion::session::{Session, SessionContext};
use companion::transport::FramedTransport;
use companion::ui_events::CompanionEvent;
use companion::{BookStore, MetadataCache};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "companion", about = "Calibre wireless-device endpoint")]
struct Args {
    /// Config file path.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the configured desktop host.
    #[arg(long)]
    host: Option<String>,
    /// Override the configured desktop port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "companion starting");

    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_PATH));
    let mut cfg = match config::load_config_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }

    // The desktop identifies the device by this uuid across sessions.
    if cfg.device_uuid.is_empty() {
        cfg.device_uuid = uuid::Uuid::new_v4().to_string();
        match config::persist_device_uuid(&config_path, &cfg.device_uuid) {
            Ok(()) => info!(device_uuid = %cfg.device_uuid, "generated device uuid"),
            Err(e) => warn!(
                error = %e,
                "could not persist device uuid; the desktop will see a new device next run"
            ),
        }
    }

    let mut store = BookStore::from_config(&cfg);
    store.initialize();

    let (event_tx, event_rx) = tokio::sync::broadcast::channel(64);
    tokio::spawn(watch_events(event_rx));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            let _ = stop_tx.send(true);
        }
    });

    info!(host = %cfg.host, port = cfg.port, "connecting to desktop");
    let connect = TcpStream::connect((cfg.host.as_str(), cfg.port));
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            eprintln!("FATAL: failed to connect to {}:{}: {e}", cfg.host, cfg.port);
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("FATAL: connecting to {}:{} timed out", cfg.host, cfg.port);
            std::process::exit(1);
        }
    };

    let ctx = SessionContext {
        device_name: cfg.device_name.clone(),
        app_version: env!("CARGO_PKG_VERSION").to_owned(),
        password: cfg.password.clone(),
        device_uuid: cfg.device_uuid.clone(),
        columns: cfg.columns.clone(),
        data_dir: cfg.data_dir.clone(),
    };
    let session = Session::new(
        FramedTransport::new(stream),
        store,
        MetadataCache::new(),
        ctx,
        event_tx,
    );
    match session.run(stop_rx).await {
        Ok(summary) => {
            if summary.books_received > 0 {
                info!(books = summary.books_received, "synchronization complete");
            } else {
                info!("session ended");
            }
        }
        Err(e) => {
            error!(error = %e, "session failed");
            std::process::exit(1);
        }
    }
}

/// Consume session events: status logging plus the cover-generation hook
/// (rendering itself belongs to the host platform, not this worker).
async fn watch_events(mut rx: tokio::sync::broadcast::Receiver<CompanionEvent>) {
    loop {
        match rx.recv().await {
            Ok(CompanionEvent::BookReceived { lpath, path }) => {
                info!(%lpath, %path, "book stored; cover generation queued");
            }
            Ok(event) => {
                if let Ok(line) = serde_json::to_string(&event) {
                    info!(event = %line, "session event");
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(n, "event watcher lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
