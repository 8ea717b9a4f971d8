use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::models::{Cell, CellKey, User, UserId};

/// Response header carrying the log handle (generation) of a shape response.
pub const SHAPE_HANDLE_HEADER: &str = "x-shape-handle";
/// Response header carrying the last log offset covered by a shape response.
pub const SHAPE_OFFSET_HEADER: &str = "x-shape-offset";

/// Logical tables exposed through the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Users,
    Cells,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Cells => "cells",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(Self::Users),
            "cells" => Ok(Self::Cells),
            other => Err(format!("unknown table: {other}")),
        }
    }
}

/// Position in a table's change log. Assigned at commit, strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogOffset(pub u64);

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Self::Insert => 0b001,
            Self::Update => 0b010,
            Self::Delete => 0b100,
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// A set of operation kinds a consumer is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationSet(u8);

impl OperationSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(0b111);
    pub const WRITES: Self = Self(Operation::Insert.bit() | Operation::Update.bit());

    pub const fn with(self, op: Operation) -> Self {
        Self(self.0 | op.bit())
    }

    pub const fn contains(self, op: Operation) -> bool {
        self.0 & op.bit() != 0
    }
}

impl FromIterator<Operation> for OperationSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

/// A row type that has its own change log.
pub trait ShapeRow: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    type Key: Clone
        + fmt::Debug
        + Eq
        + Hash
        + Ord
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static;

    const TABLE: Table;

    fn key(&self) -> Self::Key;
}

impl ShapeRow for Cell {
    type Key = CellKey;
    const TABLE: Table = Table::Cells;

    fn key(&self) -> CellKey {
        Cell::key(self)
    }
}

impl ShapeRow for User {
    type Key = UserId;
    const TABLE: Table = Table::Users;

    fn key(&self) -> UserId {
        self.id.clone()
    }
}

/// One committed row change. `value` is the post-change row for inserts and
/// updates and `None` for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "R: ShapeRow")]
pub struct ChangeMessage<R: ShapeRow> {
    pub offset: LogOffset,
    pub operation: Operation,
    pub key: R::Key,
    pub value: Option<R>,
}

impl<R: ShapeRow> ChangeMessage<R> {
    pub fn upsert(offset: LogOffset, operation: Operation, value: R) -> Self {
        Self {
            offset,
            operation,
            key: value.key(),
            value: Some(value),
        }
    }

    pub fn delete(offset: LogOffset, key: R::Key) -> Self {
        Self {
            offset,
            operation: Operation::Delete,
            key,
            value: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Control {
    /// Everything committed so far has been delivered; what follows is live.
    UpToDate,
    /// The log generation changed; discard local state and replay from a snapshot.
    MustRefetch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub control: Control,
    pub offset: LogOffset,
}

/// Wire item of the `/v1/shape` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[serde(bound = "R: ShapeRow")]
pub enum ShapeMessage<R: ShapeRow> {
    Change(ChangeMessage<R>),
    Control(ControlMessage),
}
