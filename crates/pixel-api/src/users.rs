use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::{error, info};

use pixel_db::{Database, StoreError};
use pixel_feed::Dispatcher;
use pixel_types::api::{CreateUserRequest, CreateUserResponse};
use pixel_types::models::validate_username;
use pixel_types::{Table, User};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
}

type Rejection = (StatusCode, Json<CreateUserResponse>);

fn reject(status: StatusCode, error: impl Into<String>) -> Rejection {
    (status, Json(CreateUserResponse::failed(error)))
}

/// POST /api/users
pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, Rejection> {
    // Validate input
    validate_username(&req.username).map_err(|e| reject(StatusCode::BAD_REQUEST, e.to_string()))?;
    req.id.validate().map_err(|e| reject(StatusCode::BAD_REQUEST, e.to_string()))?;
    if req.pixels_placed < 0 {
        return Err(reject(StatusCode::BAD_REQUEST, "pixels_placed must not be negative"));
    }

    let user = User {
        id: req.id,
        username: req.username,
        pixels_placed: req.pixels_placed,
        last_active: req.last_active,
        created_at: req.created_at,
    };

    // Run blocking DB insert off the async runtime
    let db = state.db.clone();
    let (user, offset) = tokio::task::spawn_blocking(move || db.create_user(&user))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create user")
        })?
        .map_err(|e| match e {
            StoreError::DuplicateUsername(name) => {
                reject(StatusCode::CONFLICT, format!("Username {name:?} is already taken"))
            }
            StoreError::DuplicateUserId(id) => reject(StatusCode::CONFLICT, format!("User id {id} already exists")),
            other => {
                error!("Error creating user: {}", other);
                reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create user")
            }
        })?;

    state.dispatcher.committed(Table::Users, offset);
    info!("{} ({}) joined the canvas", user.username, user.id);

    Ok((StatusCode::CREATED, Json(CreateUserResponse::created(user))))
}
