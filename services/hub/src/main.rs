use std::env;
use std::sync::Arc;

use hub::auth::{CachingTokenVerifier, TokenVerifier};
use hub::config::HubConfig;
use hub::db;
use hub::repo::identity::PgIdentityService;
use hub::repo::tokens::{PgRevokedTokenChecker, PgTokenVerifier};
use hub::repo::users::PgUserRepository;
use hub::{AppState, Collaborators};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let config = HubConfig::from_env();

    info!("connecting to database...");
    let pool = db::create_pool(&database_url).await;
    db::run_migrations(&pool).await;
    info!("migrations applied");

    let verifier = Arc::new(CachingTokenVerifier::new(
        Arc::new(PgTokenVerifier::new(pool.clone())) as Arc<dyn TokenVerifier>,
        config.token_cache_ttl,
    ));
    let state = AppState::new(
        config,
        Collaborators {
            users: Arc::new(PgUserRepository::new(pool.clone())),
            verifier,
            revoked: Arc::new(PgRevokedTokenChecker::new(pool.clone())),
            identity: Arc::new(PgIdentityService::new(pool)),
        },
    );
    let router = hub::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, shards = state.config.effective_shards(), "hub listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    state.shutdown().await;
    info!("hub shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
