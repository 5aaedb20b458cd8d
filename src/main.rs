//! usage-monitor - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the monitoring API.

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usage_monitor::{api, config::PassphraseSource, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "usage_monitor=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = AppConfig::from_env()?;
    info!(
        "Loaded configuration: backend={}, usage endpoint={}",
        config.backend.mode(),
        config.usage.url
    );

    if config.admin_password_generated {
        warn!(
            "ADMIN_PASSWORD is not set; generated admin password for this run: {}",
            config.admin_password
        );
    }
    match config.passphrase.source {
        PassphraseSource::Explicit => info!("Credential encryption uses ENCRYPTION_SECRET"),
        PassphraseSource::AdminPassword => warn!(
            "ENCRYPTION_SECRET is not set; credential encryption is derived from ADMIN_PASSWORD"
        ),
        PassphraseSource::GeneratedPassword => warn!(
            "ENCRYPTION_SECRET and ADMIN_PASSWORD are not set; keys stored in this run \
             become unreadable after a restart"
        ),
    }
    if !config.passphrase.previous.is_empty() {
        info!(
            "{} previous passphrase(s) accepted for decryption",
            config.passphrase.previous.len()
        );
    }

    // Start HTTP server
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting server on {}", addr);

    api::serve(config).await?;

    Ok(())
}
