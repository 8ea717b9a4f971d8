//! Scripted upstream and row builders shared by unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use pixel_types::{
    Cell, CellKey, ChangeMessage, Color, Control, ControlMessage, LogOffset, Operation, ShapeMessage, ShapeRow,
    User, UserId,
};

use crate::backend::WriteBackend;
use crate::change_log::{ShapeRequest, ShapeResponse, ShapeSource};
use crate::error::{ClientError, ConnectionError};

enum Scripted {
    Batch {
        handle: String,
        offset: LogOffset,
        messages: Value,
    },
    Fail(ConnectionError),
}

/// Answers each fetch with the next scripted response, waiting like a long
/// poll while the script is empty.
pub struct ScriptedSource {
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<Scripted>>,
    requests: Mutex<Vec<ShapeRequest>>,
}

impl ScriptedSource {
    pub fn requests(&self) -> Vec<ShapeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[derive(Clone)]
pub struct Script(mpsc::UnboundedSender<Scripted>);

impl Script {
    pub fn batch(&self, handle: &str, offset: u64, messages: Vec<Value>) {
        self.0
            .send(Scripted::Batch {
                handle: handle.to_string(),
                offset: LogOffset(offset),
                messages: Value::Array(messages),
            })
            .unwrap();
    }

    pub fn fail(&self, error: ConnectionError) {
        self.0.send(Scripted::Fail(error)).unwrap();
    }
}

pub fn scripted() -> (Arc<ScriptedSource>, Script) {
    let (tx, rx) = mpsc::unbounded_channel();
    let source = ScriptedSource {
        responses: tokio::sync::Mutex::new(rx),
        requests: Mutex::new(Vec::new()),
    };
    (Arc::new(source), Script(tx))
}

#[async_trait]
impl ShapeSource for ScriptedSource {
    async fn fetch<R: ShapeRow>(&self, request: &ShapeRequest) -> Result<ShapeResponse<R>, ConnectionError> {
        self.requests.lock().unwrap().push(request.clone());

        let next = self.responses.lock().await.recv().await;
        match next {
            Some(Scripted::Batch {
                handle,
                offset,
                messages,
            }) => Ok(ShapeResponse {
                handle,
                offset,
                messages: serde_json::from_value(messages).map_err(|e| ConnectionError::Decode(e.to_string()))?,
            }),
            Some(Scripted::Fail(error)) => Err(error),
            None => std::future::pending().await,
        }
    }
}

/// Accepts every write, enforcing unique usernames like the server does.
#[derive(Default)]
pub struct EchoBackend {
    users: Mutex<Vec<User>>,
}

impl EchoBackend {
    pub fn created(&self) -> Vec<User> {
        self.users.lock().unwrap().clone()
    }
}

#[async_trait]
impl WriteBackend for EchoBackend {
    async fn create_user(&self, user: &User) -> Result<User, ClientError> {
        let mut users = self.users.lock().unwrap();
        if users.iter().any(|u| u.username == user.username) {
            return Err(ClientError::DuplicateUsername(user.username.clone()));
        }
        users.push(user.clone());
        Ok(user.clone())
    }

    async fn upsert_cell(&self, cell: &Cell) -> Result<Cell, ClientError> {
        Ok(cell.clone())
    }
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn cell(x: i32, y: i32, color: &str, user: &str, secs: i64) -> Cell {
    Cell::new(CellKey::new(x, y), Color::parse(color).unwrap(), UserId::new(user), ts(secs))
}

pub fn user(id: &str, username: &str, pixels_placed: i64) -> User {
    User {
        id: UserId::new(id),
        username: username.to_string(),
        pixels_placed,
        last_active: ts(0),
        created_at: ts(0),
    }
}

pub fn change<R: ShapeRow>(offset: u64, operation: Operation, row: R) -> Value {
    serde_json::to_value(ShapeMessage::Change(ChangeMessage::upsert(LogOffset(offset), operation, row))).unwrap()
}

pub fn delete_cell(offset: u64, x: i32, y: i32) -> Value {
    serde_json::to_value(ShapeMessage::<Cell>::Change(ChangeMessage::delete(
        LogOffset(offset),
        CellKey::new(x, y),
    )))
    .unwrap()
}

fn control(control: Control, offset: u64) -> Value {
    serde_json::to_value(ShapeMessage::<Cell>::Control(ControlMessage {
        control,
        offset: LogOffset(offset),
    }))
    .unwrap()
}

pub fn up_to_date(offset: u64) -> Value {
    control(Control::UpToDate, offset)
}

pub fn must_refetch(offset: u64) -> Value {
    control(Control::MustRefetch, offset)
}
