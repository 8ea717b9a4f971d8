use axum::{Json, extract::State, http::StatusCode};
use tracing::{debug, error, warn};

use pixel_db::StoreError;
use pixel_types::api::{ErrorResponse, UpsertCellRequest};
use pixel_types::{Cell, CellKey, Color, Table};

use crate::users::AppState;

type Rejection = (StatusCode, Json<ErrorResponse>);

fn reject(status: StatusCode, error: impl Into<String>) -> Rejection {
    (status, Json(ErrorResponse { error: error.into() }))
}

/// POST /api/pixels: upsert one cell.
///
/// Last write by commit order wins: the row is overwritten unconditionally and
/// the change log records the commit, which is what subscribers converge on.
pub async fn upsert_cell(
    State(state): State<AppState>,
    Json(req): Json<UpsertCellRequest>,
) -> Result<Json<Cell>, Rejection> {
    let color = Color::parse(&req.color).map_err(|e| {
        warn!("Rejected pixel at ({}, {}): {}", req.x, req.y, e);
        reject(StatusCode::BAD_REQUEST, e.to_string())
    })?;
    req.user_id.validate().map_err(|e| reject(StatusCode::BAD_REQUEST, e.to_string()))?;

    let cell = Cell::new(CellKey::new(req.x, req.y), color, req.user_id, req.last_updated);

    // Run blocking DB upsert off the async runtime
    let db = state.db.clone();
    let commit = tokio::task::spawn_blocking(move || db.upsert_cell(&cell))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update pixel")
        })?
        .map_err(|e| match e {
            StoreError::UnknownUser(id) => reject(StatusCode::BAD_REQUEST, format!("Unknown user {id}")),
            other => {
                error!("Error updating pixel: {}", other);
                reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update pixel")
            }
        })?;

    state.dispatcher.committed(Table::Cells, commit.cell_offset);
    state.dispatcher.committed(Table::Users, commit.user_offset);
    debug!(
        "{} {} -> {} by {} at offset {}",
        commit.cell_operation.as_str(),
        commit.cell.key(),
        commit.cell.color,
        commit.cell.user_id,
        commit.cell_offset
    );

    Ok(Json(commit.cell))
}
