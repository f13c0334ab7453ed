//! Vault Service (VaultSrv)
//! Sealed-message escalation: reminders, presence confirmation, disclosure

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use vault_token::TokenCodec;

use vaultsrv::api::{create_router, AppState};
use vaultsrv::domain::SystemClock;
use vaultsrv::engine::EscalationEngine;
use vaultsrv::notify::NotificationGateway;
use vaultsrv::sweeper::Sweeper;
use vaultsrv::{storage, VaultConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Vault Service...");

    let config = VaultConfig::load()?;
    let policy = config.policy()?;
    info!(
        "escalation ladder: {} stage(s), sweep every {}s",
        policy.stage_count(),
        config.escalation.sweep_interval_secs
    );

    let pool = storage::connect(&config.database.path, config.database.max_connections).await?;
    storage::init_schema(&pool).await?;

    let gateway = NotificationGateway::from_config(&config.notifier)?;
    let codec = TokenCodec::new(&config.token.secret);

    let engine = Arc::new(EscalationEngine::new(
        pool,
        policy,
        gateway,
        codec,
        Arc::new(SystemClock),
        config.fast_lane.clone(),
    ));

    let sweeper = Arc::new(Sweeper::new(
        engine.clone(),
        config.escalation.sweep_interval_secs,
    ));
    {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run().await });
    }

    let app = create_router(AppState { engine }).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.service.host, config.service.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Vault Service started on {}", addr);
    info!("API endpoints:");
    info!("  GET  /health - Health check");
    info!("  POST /api/v1/messages - Create sealed message");
    info!("  POST /api/v1/messages/{{id}}/escalation/start - Begin ladder");
    info!("  POST /api/v1/sweep - Run a sweep pass");
    info!("  GET  /api/v1/presence/confirm - Redeem survival token");
    info!("  POST /api/v1/messages/{{id}}/fast-unlock - Phone-verified disclosure");

    axum::serve(listener, app).await?;

    sweeper.stop();
    Ok(())
}
