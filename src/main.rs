mod api;
mod config;
mod firewall;
mod metrics;

use anyhow::Result;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::{env, sync::Arc};
use tokio::net::TcpListener;

use config::{ConfigHandle, FirewallConfig};
use firewall::reputation::RedisBanStore;
use firewall::security_log::SecurityLogger;
use firewall::Firewall;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vetshield=info,tower_http=info".into()),
        )
        .init();

    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let port = env::var("PORT")
        .unwrap_or_else(|_| "8081".to_string())
        .parse::<u16>()?;
    let config_path = env::var("WAF_CONFIG").ok().map(PathBuf::from);

    let firewall_config = FirewallConfig::load(config_path.as_deref())?;
    let logger = Arc::new(SecurityLogger::to_file(&firewall_config.security_log_path));
    let config = ConfigHandle::new(firewall_config);

    // Keep the watcher alive for the life of the process
    let _watcher = match &config_path {
        Some(path) if path.exists() => {
            Some(config::spawn_reload_watcher(config.clone(), path.clone())?)
        }
        _ => None,
    };

    let redis_client = redis::Client::open(redis_url.as_str())?;
    let firewall = Arc::new(Firewall::new(
        config,
        Box::new(RedisBanStore::new(redis_client)),
        logger,
    ));

    let app = api::create_router(firewall);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "vetshield firewall listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
