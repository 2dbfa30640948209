use std::time::Duration;

mod app;
mod auth;
mod config;
mod errors;
mod qrcodes;
mod state;
mod store;

use crate::config::AppConfig;
use crate::state::AppState;
use crate::store::BackendKind;

const SESSION_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "qrcodes=debug,axum=info,tower_http=info,sqlx=warn".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = AppConfig::from_env()?;
    if config.google.credentials().is_none() {
        tracing::warn!("GOOGLE_CLIENT_ID / GOOGLE_CLIENT_SECRET not set; login is disabled");
    }

    let app_state = AppState::init(config).await?;

    // Run migrations if present
    if let (BackendKind::Postgres, Some(pool)) = (app_state.store.kind(), app_state.store.pg_pool()) {
        if let Err(e) = sqlx::migrate!("./migrations").run(pool).await {
            tracing::warn!(error = %e, "migrations failed; continuing");
        }
    }

    auth::sessions::spawn_pruner(app_state.sessions.clone(), SESSION_PRUNE_INTERVAL);

    tracing::info!(
        storage = app_state.store.kind().as_str(),
        sessions = app_state.sessions.kind(),
        "qr code manager starting"
    );
    app::serve(app::build_app(app_state)).await
}
