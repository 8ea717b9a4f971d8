//! `GET /v1/shape`: the change-log subscription endpoint.
//!
//! A subscriber starts with `offset=-1` and receives a snapshot (the latest row
//! per key) followed by an `up-to-date` control message. It then polls with
//! the offset from the `x-shape-offset` header. With `live=true` an empty poll
//! is held open until a commit lands or the long-poll window closes.
//!
//! Every response carries `x-shape-handle`. A request naming another handle
//! (the database was replaced) gets `409` and a `must-refetch` control message.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, warn};

use pixel_db::{Database, LogEntryRow, StoreError};
use pixel_types::api::ShapeQuery;
use pixel_types::events::{SHAPE_HANDLE_HEADER, SHAPE_OFFSET_HEADER};
use pixel_types::{Cell, Control, ControlMessage, LogOffset, ShapeMessage, ShapeRow, Table, User};

use crate::dispatcher::Dispatcher;

/// Catch-up responses carry at most this many entries by default.
pub const DEFAULT_BATCH_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct FeedState {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub source_id: String,
    pub long_poll: Duration,
    pub batch_limit: u32,
}

pub async fn get_shape(
    State(state): State<FeedState>,
    Query(query): Query<ShapeQuery>,
) -> Result<Response, StatusCode> {
    if query.source_id != state.source_id {
        warn!("Shape request for unknown source {:?}", query.source_id);
        return Err(StatusCode::NOT_FOUND);
    }

    match query.table {
        Table::Users => respond::<User>(&state, &query).await,
        Table::Cells => respond::<Cell>(&state, &query).await,
    }
}

async fn respond<R: ShapeRow>(state: &FeedState, query: &ShapeQuery) -> Result<Response, StatusCode> {
    let handle = state.db.log_handle().to_string();

    if query.handle.as_deref().is_some_and(|h| h != handle) {
        debug!("{} subscriber holds stale handle {:?}", R::TABLE, query.handle);
        return Ok(must_refetch::<R>(&handle, state.dispatcher.head(R::TABLE)));
    }

    if query.offset < 0 {
        let db = state.db.clone();
        let snapshot = run_blocking(move || db.snapshot(R::TABLE)).await?;
        let mut messages = decode_all::<R>(&snapshot.entries)?;
        messages.push(up_to_date(snapshot.head));
        return Ok(shape_response(&handle, snapshot.head, messages));
    }

    let after = LogOffset(query.offset as u64);
    let db = state.db.clone();
    let head = run_blocking(move || db.head(R::TABLE)).await?;
    if after > head {
        // An offset this log never handed out: the caller is following some
        // other log, so make it start over.
        return Ok(must_refetch::<R>(&handle, head));
    }

    let mut entries = fetch_since(state, R::TABLE, after).await?;
    if entries.is_empty()
        && query.live
        && state.dispatcher.wait_past(R::TABLE, after, state.long_poll).await
    {
        entries = fetch_since(state, R::TABLE, after).await?;
    }

    let caught_up = entries.len() < state.batch_limit as usize;
    let last = entries.last().map_or(after, LogEntryRow::offset);
    let mut messages = decode_all::<R>(&entries)?;
    if caught_up {
        messages.push(up_to_date(last));
    }

    Ok(shape_response(&handle, last, messages))
}

async fn fetch_since(state: &FeedState, table: Table, after: LogOffset) -> Result<Vec<LogEntryRow>, StatusCode> {
    let db = state.db.clone();
    let limit = state.batch_limit;
    run_blocking(move || db.changes_since(table, after, limit)).await
}

/// Run a blocking DB call off the async runtime.
async fn run_blocking<T, F>(f: F) -> Result<T, StatusCode>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("Change log read failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

fn decode_all<R: ShapeRow>(entries: &[LogEntryRow]) -> Result<Vec<ShapeMessage<R>>, StatusCode> {
    entries
        .iter()
        .map(|entry| {
            entry.decode::<R>().map(ShapeMessage::Change).map_err(|e| {
                error!("Undecodable {} change log entry: {}", R::TABLE, e);
                StatusCode::INTERNAL_SERVER_ERROR
            })
        })
        .collect()
}

fn up_to_date<R: ShapeRow>(offset: LogOffset) -> ShapeMessage<R> {
    ShapeMessage::Control(ControlMessage {
        control: Control::UpToDate,
        offset,
    })
}

fn must_refetch<R: ShapeRow>(handle: &str, head: LogOffset) -> Response {
    let message: ShapeMessage<R> = ShapeMessage::Control(ControlMessage {
        control: Control::MustRefetch,
        offset: head,
    });
    (StatusCode::CONFLICT, shape_headers(handle, head), Json(vec![message])).into_response()
}

fn shape_response<R: ShapeRow>(handle: &str, offset: LogOffset, messages: Vec<ShapeMessage<R>>) -> Response {
    (shape_headers(handle, offset), Json(messages)).into_response()
}

fn shape_headers(handle: &str, offset: LogOffset) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(handle) {
        headers.insert(SHAPE_HANDLE_HEADER, value);
    }
    headers.insert(SHAPE_OFFSET_HEADER, HeaderValue::from(offset.0));
    headers
}
