mod config;
mod gemini;
mod image;
mod server;
mod telegram;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration: optional file, then environment
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load config".to_string(),
    })?;

    info!("Configuration loaded successfully");
    info!("  Model: {}", config.gemini.model);
    info!("  Gemini key: {}", present(config.gemini.api_key.is_some()));
    info!("  Telegram token: {}", present(config.telegram.bot_token.is_some()));
    info!(
        "  Web app URL: {}",
        config.telegram.webapp_url().unwrap_or("<not set>")
    );

    let state = AppState::from_config(&config)?;

    info!("Relay is starting...");
    server::serve(&config.server, state).await?;

    Ok(())
}

fn present(set: bool) -> &'static str {
    if set {
        "set"
    } else {
        "<not set>"
    }
}
