//! fieldlink service - device gateway and HTTP API.
//!
//! Run with: `cargo run -p fieldlink-service`

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use fieldlink_service::{AppState, Config, app, tcp};
use fieldlink_store::Store;

/// fieldlink service - sensor device gateway and HTTP REST API.
#[derive(Parser, Debug)]
#[command(name = "fieldlink-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Raw TCP device listener address (overrides config).
    #[arg(long)]
    tcp_bind: Option<String>,

    /// Bearer token signing secret (overrides config).
    #[arg(long, env = "FIELDLINK_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fieldlink_service=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!("Ignoring unreadable default config: {}", e);
            Config::default()
        }),
    };

    // Override config with CLI args
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }
    if let Some(tcp_bind) = args.tcp_bind {
        config.session.tcp_bind = Some(tcp_bind);
    }
    if let Some(secret) = args.jwt_secret {
        config.auth.jwt_secret = Some(secret);
    }
    config.validate()?;

    let store = Store::open(&config.storage.path)?;
    let state = AppState::new(store, config.clone());

    let tcp_task = match &config.session.tcp_bind {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            Some(tokio::spawn(tcp::serve(listener, state.clone())))
        }
        None => {
            info!("Raw TCP device listener disabled");
            None
        }
    };

    let addr: SocketAddr = config.server.bind.parse()?;
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = state.shutdown.clone();
    let server = axum::serve(
        listener,
        app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });
    server.await?;

    // Let device sessions finish the message they are handling
    state.shutdown.cancel();
    if let Some(task) = tcp_task {
        task.await?;
    }
    state.connections.close();
    state.connections.wait().await;

    info!("Server stopped");
    Ok(())
}
