//! statuswatch server
//!
//! Run with: cargo run
//!
//! Environment variables (see `statuswatch::config` for the full list):
//! - STATUSWATCH_CONFIG: JSON config file with entities and alert channels
//! - STATUSWATCH_HOST / STATUSWATCH_PORT: API bind address (default: 0.0.0.0:8080)
//! - STATUSWATCH_DISCORD_TOKEN / STATUSWATCH_GUILD_ID: platform credentials; without
//!   them alerts are only logged
//! - RUST_LOG: Log level (default: info)

use statuswatch::api::run_server;
use statuswatch::MonitorConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "statuswatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MonitorConfig::from_env()?;

    tracing::info!("statuswatch {} configuration:", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Host: {}:{}", config.host, config.port);
    tracing::info!("  Upstream: {}", config.upstream_endpoint);
    tracing::info!("  Poll interval: {} seconds", config.poll_interval_secs);
    tracing::info!("  History depth: {}", config.history_depth);
    tracing::info!(
        "  Thresholds: down={} up={}",
        config.down_threshold,
        config.up_threshold
    );
    tracing::info!(
        "  Role sync: cooldown={}s retries={} backoff={}s",
        config.debounce_cooldown_secs,
        config.retry_max,
        config.retry_backoff_base_secs
    );
    tracing::info!("  Data dir: {}", config.data_dir.display());
    tracing::info!("  Entities: {}", config.entities.len());
    for entity in &config.entities {
        tracing::info!("    - {} ({})", entity.display_name, entity.kind);
    }
    tracing::info!("  Alert channels: {}", config.channels.len());
    for channel in &config.channels {
        tracing::info!(
            "    - {} role={} emoji={}",
            channel.channel_id,
            channel.mention_role_id.as_deref().unwrap_or("none"),
            channel.emoji()
        );
    }

    run_server(config).await
}
