//! # Roomcast Server
//!
//! Real-time publish/subscribe relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! roomcast
//!
//! # Run with environment variables
//! ROOMCAST_PORT=8080 ROOMCAST_HOST=0.0.0.0 roomcast
//!
//! # Subscribe
//! websocat ws://127.0.0.1:8080/ <<< '{"event":"subscribe","cluster":"acme","room":"news"}'
//!
//! # Publish
//! curl -X POST http://127.0.0.1:8080/publish \
//!   -d '{"cluster":"acme","room":"news","data":{"headline":"hi"}}'
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,roomcast_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Roomcast server on {}:{} (capacity {}, storage {:?})",
        config.host,
        config.port,
        config.coordinator.capacity,
        config.storage.backend
    );

    // Initialize metrics
    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
