pub mod api;
pub mod events;
pub mod models;

pub use events::{
    ChangeMessage, Control, ControlMessage, LogOffset, Operation, OperationSet, ShapeMessage,
    ShapeRow, Table,
};
pub use models::{Cell, CellKey, Color, User, UserId, ValidationError};
