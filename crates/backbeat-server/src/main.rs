//! # Backbeat Server
//!
//! Realtime connection hub for the Backbeat platform.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! backbeat
//!
//! # Run with a specific config file
//! BACKBEAT_CONFIG=/path/to/backbeat.toml backbeat
//!
//! # Run with environment variables
//! BACKBEAT_PORT=8080 BACKBEAT_HOST=0.0.0.0 backbeat
//! ```

use std::sync::Arc;

use anyhow::Result;
use backbeat_server::auth::JwtAuthenticator;
use backbeat_server::{config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("BACKBEAT_LOG")
                .unwrap_or_else(|_| "backbeat_server=debug,backbeat_core=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Backbeat server on {}:{}",
        config.server.host,
        config.server.port
    );

    // Initialize metrics
    metrics::init_metrics();

    let auth = Arc::new(JwtAuthenticator::new(&config.auth.jwt_secret));
    let directory = Arc::new(backbeat_core::NoFollowers);
    handlers::run_server(config, auth, directory).await?;

    Ok(())
}
