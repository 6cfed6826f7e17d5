mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use snapfeed_api::identity::{GoogleVerifier, IdentityService};
use snapfeed_api::image_host::ImageHost;
use snapfeed_api::session::SessionContext;
use snapfeed_api::{AppState, AppStateInner};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "snapfeed=debug,snapfeed_api=debug,snapfeed_db=info,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(snapfeed_db::Database::open(&config.db_path)?);

    // Outbound services share one HTTP client
    let http = reqwest::Client::builder()
        .user_agent(concat!("snapfeed/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let google = match &config.google_client_id {
        Some(client_id) => Some(GoogleVerifier::new(
            http.clone(),
            config.google_tokeninfo_url.clone(),
            client_id.clone(),
        )),
        None => {
            info!("SNAPFEED_GOOGLE_CLIENT_ID unset; Google sign-in disabled");
            None
        }
    };

    let identity = Arc::new(IdentityService::new(db.clone(), config.jwt_secret.clone(), google));
    let session = SessionContext::attach(&identity, db.clone());
    let images = ImageHost::new(http, config.image_upload_url.clone(), config.upload_preset.clone());

    let state: AppState = Arc::new(AppStateInner {
        db,
        identity,
        images,
        session,
    });

    let app = snapfeed_api::router(state.clone(), config.max_upload_bytes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Snapfeed server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.session.teardown();
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
