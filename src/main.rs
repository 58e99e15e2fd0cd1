//! membridge entrypoint
//!
//! Reads configuration from the environment, connects to the Redis backend,
//! and serves the Memcached text protocol until SIGINT or SIGTERM.

use anyhow::Context;
use membridge::{Config, Keyspace, RedisStore, server};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let backend = RedisStore::connect(&config.redis_url).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(port = config.port, prefix = %config.redis_prefix, "listening");

    server::run(
        listener,
        backend,
        Keyspace::new(config.redis_prefix),
        shutdown_signal(),
    )
    .await?;

    info!("exited");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    use tracing::warn;

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(cause = %err, "SIGTERM handler unavailable, falling back to SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("signal caught: SIGINT"),
        _ = term.recv() => info!("signal caught: SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
