//! Client core for the shared pixel canvas.
//!
//! [`ChangeLog`] tails a server table and fans it out to subscribers,
//! [`Matcher`] waits for a specific change to appear in it, and
//! [`WriteCoordinator`] combines the two into optimistic writes over a
//! [`GridStore`]. [`Viewport`] maps the grid to the screen and [`Session`]
//! wires everything to a running server.

pub mod auth;
pub mod backend;
pub mod canvas;
pub mod change_log;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod grid;
pub mod matcher;
pub mod session;
pub mod view_state;
pub mod viewport;

#[cfg(test)]
mod testing;

pub use auth::{AuthRecord, AuthStore};
pub use backend::{HttpBackend, WriteBackend};
pub use canvas::{Canvas, Frame, HoverInfo};
pub use change_log::{ChangeLog, ConnectionStatus, HttpShapeSource, LogEvent, ShapeSource, Subscription};
pub use config::{ClientConfig, RetryPolicy};
pub use coordinator::WriteCoordinator;
pub use directory::UserDirectory;
pub use error::{ClientError, ConnectionError};
pub use grid::{GridStore, WriteId};
pub use matcher::{MatchState, Matcher};
pub use session::Session;
pub use view_state::{DebouncedViewSaver, ViewStateStore};
pub use viewport::{ScreenPoint, ViewState, Viewport, WorldRect};
