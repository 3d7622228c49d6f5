//! Herald relay binary entrypoint.

use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::{create_pool, run_migrations};

use herald_relay::queue::RedisStreamQueue;
use herald_relay::service::{RelayService, RelaySettings};
use herald_relay::store::PgUserStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = AppConfig::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("herald_relay=debug,herald_common=info,tower_http=info")
    });
    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting Herald relay...");

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    // Subscribe to the notification queue; no queue, no relay
    let queue = RedisStreamQueue::connect(
        &config.redis_url,
        &config.notification_queue,
        &config.consumer_group,
        &config.consumer_name,
    )
    .await?;

    let service = RelayService::new(
        config.jwt_secret.clone(),
        queue,
        PgUserStore::new(pool),
        RelaySettings::from_config(&config),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.relay_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    service
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    tracing::info!("Herald relay stopped.");
    Ok(())
}
