//! Requestarr - media request broker for Plex, Sonarr and Radarr
//!
//! # Usage
//!
//! ```bash
//! # Run with configuration from the environment (or .env)
//! APP_SECRET_KEY=... PRESHARED_PASSWORD=... TMDB_API_KEY=... \
//! cargo run --release
//!
//! # Custom bind address and data directory
//! requestarr --addr 0.0.0.0:9000 --data-dir /var/lib/requestarr
//! ```
//!
//! # Environment Variables
//!
//! See `config` module docs for the full key list. `RUST_LOG` controls
//! logging (default: info).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use requestarr::{create_app, AppConfig, AppState, SledStore};

#[derive(Parser, Debug)]
#[command(name = "requestarr")]
#[command(about = "Lightweight media request broker for Plex, Sonarr and Radarr")]
#[command(version)]
struct CliArgs {
    /// Bind address for the HTTP server
    #[arg(short, long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,

    /// Directory for the embedded database
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("requestarr=info,tower_http=info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = AppConfig::from_env().context("loading configuration")?;

    let store = Arc::new(
        SledStore::open(&args.data_dir)
            .with_context(|| format!("opening database at {}", args.data_dir))?,
    );
    let state = AppState::new(store, config);
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    info!("listening on {}", args.addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}
