//! # Murmur Server
//!
//! Realtime chat hub that fans every message out to all connected users.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! murmur
//!
//! # Run with a specific config file
//! MURMUR_CONFIG=/path/to/murmur.toml murmur
//!
//! # Run with environment variables
//! MURMUR_PORT=8080 MURMUR_HOST=0.0.0.0 MURMUR__LIMITS__MAX_CONNECTIONS=32 murmur
//! ```

use anyhow::Result;
use murmur_server::{config::Config, handlers};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Murmur server on {}:{}", config.host, config.port);

    handlers::run_server(config).await?;

    Ok(())
}
