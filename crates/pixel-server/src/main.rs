use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use pixel_api::{AppState, AppStateInner, SourceSecret};
use pixel_db::Database;
use pixel_feed::{Dispatcher, FeedState, shape::DEFAULT_BATCH_LIMIT};
use pixel_types::Table;

const DEV_SECRET: &str = "dev-secret-change-me";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pixel=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("PIXEL_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PIXEL_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let db_path: PathBuf = std::env::var("PIXEL_DB_PATH")
        .unwrap_or_else(|_| "pixels.db".into())
        .into();
    let source_id = std::env::var("PIXEL_SOURCE_ID").unwrap_or_else(|_| "canvas".into());
    let source_secret = std::env::var("PIXEL_SOURCE_SECRET").unwrap_or_else(|_| DEV_SECRET.into());
    if source_secret == DEV_SECRET {
        warn!("PIXEL_SOURCE_SECRET is unset; using the development secret");
    }
    let long_poll_secs: u64 = std::env::var("PIXEL_LONG_POLL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);

    // Init database
    let db = Arc::new(Database::open(&db_path)?);
    let dispatcher = Dispatcher::new(db.head(Table::Users)?, db.head(Table::Cells)?);
    info!("Change log {} opened from {}", db.log_handle(), db_path.display());

    // Shared state
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        dispatcher: dispatcher.clone(),
    });
    let feed = FeedState {
        db,
        dispatcher,
        source_id,
        long_poll: Duration::from_secs(long_poll_secs),
        batch_limit: DEFAULT_BATCH_LIMIT,
    };

    let app = pixel_api::router(app_state, feed, SourceSecret(source_secret.into()));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Pixel server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let Ok(mut sigterm) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
            ctrl_c.await.ok();
            info!("Received Ctrl+C, shutting down...");
            return;
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
