use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use pixel_types::api::{CreateUserRequest, CreateUserResponse, ErrorResponse, UpsertCellRequest};
use pixel_types::{Cell, User};

use crate::config::ClientConfig;
use crate::error::{ClientError, ConnectionError};

/// Durable writes.
#[async_trait]
pub trait WriteBackend: Send + Sync + 'static {
    async fn create_user(&self, user: &User) -> Result<User, ClientError>;
    async fn upsert_cell(&self, cell: &Cell) -> Result<Cell, ClientError>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }
}

fn transport(e: reqwest::Error) -> ClientError {
    ClientError::Connection(ConnectionError::Transport(e.to_string()))
}

/// Map a non-success status to the error taxonomy.
fn classify(status: StatusCode, message: String) -> ClientError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ClientError::Validation(message),
        s if s.is_server_error() => ClientError::Storage(message),
        s => ClientError::Storage(format!("unexpected status {}: {}", s.as_u16(), message)),
    }
}

#[async_trait]
impl WriteBackend for HttpBackend {
    async fn create_user(&self, user: &User) -> Result<User, ClientError> {
        let body = CreateUserRequest {
            id: user.id.clone(),
            username: user.username.clone(),
            pixels_placed: user.pixels_placed,
            last_active: user.last_active,
            created_at: user.created_at,
        };

        let resp = self
            .client
            .post(format!("{}/api/users", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            return Err(ClientError::DuplicateUsername(user.username.clone()));
        }

        // Error statuses from the handler carry the same envelope; anything
        // else (a proxy page, a decode failure) falls back to the status text.
        let reply = resp.json::<CreateUserResponse>().await.ok();
        match reply {
            Some(CreateUserResponse {
                success: true,
                user: Some(created),
                ..
            }) if status.is_success() => {
                debug!("Created user {} ({})", created.username, created.id);
                Ok(created)
            }
            Some(reply) if status.is_success() => Err(ClientError::Validation(
                reply.error.unwrap_or_else(|| "user was not created".into()),
            )),
            Some(reply) => Err(classify(status, reply.error.unwrap_or_else(|| status.to_string()))),
            None => Err(classify(status, status.to_string())),
        }
    }

    async fn upsert_cell(&self, cell: &Cell) -> Result<Cell, ClientError> {
        let body = UpsertCellRequest {
            x: cell.x,
            y: cell.y,
            color: cell.color.as_str().to_string(),
            user_id: cell.user_id.clone(),
            last_updated: cell.last_updated,
        };

        let resp = self
            .client
            .post(format!("{}/api/pixels", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<Cell>()
                .await
                .map_err(|e| ClientError::Storage(format!("malformed pixel response: {e}")));
        }

        let message = match resp.json::<ErrorResponse>().await {
            Ok(err) => err.error,
            Err(_) => status.to_string(),
        };
        Err(classify(status, message))
    }
}
