use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use tracing::warn;

/// The secret shape subscribers present as a bearer token.
#[derive(Clone)]
pub struct SourceSecret(pub Arc<str>);

/// Reject shape requests that do not carry the source secret.
pub async fn require_source_token(
    State(secret): State<SourceSecret>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(TypedHeader(Authorization(bearer))) = bearer else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    if bearer.token() != &*secret.0 {
        warn!("Shape request with a bad source token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}
