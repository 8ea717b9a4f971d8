pub mod cells;
pub mod middleware;
pub mod users;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use pixel_feed::FeedState;

pub use middleware::SourceSecret;
pub use users::{AppState, AppStateInner};

/// Build the full HTTP surface: the write API plus the change-log feed.
pub fn router(app: AppState, feed: FeedState, secret: SourceSecret) -> Router {
    let api = Router::new()
        .route("/api/users", post(users::create_user))
        .route("/api/pixels", post(cells::upsert_cell))
        .with_state(app);

    let shape = Router::new()
        .route("/v1/shape", get(pixel_feed::get_shape))
        .route_layer(axum_middleware::from_fn_with_state(secret, middleware::require_source_token))
        .with_state(feed);

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .merge(shape)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// GET /health: liveness check (no auth).
async fn health() -> &'static str {
    "ok"
}
