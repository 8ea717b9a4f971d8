//! One signed-in client: both change logs, the local stores and the canvas.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use pixel_types::{Cell, Color, User};

use crate::auth::{AuthRecord, AuthStore, login};
use crate::backend::HttpBackend;
use crate::canvas::Canvas;
use crate::change_log::{ChangeLog, ConnectionStatus, HttpShapeSource};
use crate::config::ClientConfig;
use crate::coordinator::WriteCoordinator;
use crate::directory::UserDirectory;
use crate::error::ClientError;
use crate::grid::GridStore;
use crate::view_state::{DebouncedViewSaver, ViewStateStore};
use crate::viewport::Viewport;

pub const DEFAULT_COLOR: &str = "#000000";

pub struct Session {
    auth: AuthRecord,
    users: ChangeLog<User>,
    cells: ChangeLog<Cell>,
    canvas: Canvas<HttpBackend>,
    appliers: Vec<JoinHandle<()>>,
}

impl Session {
    /// Log in as `username`, load both tables and restore the saved view for
    /// a canvas of `width` by `height` pixels.
    pub async fn start(config: &ClientConfig, username: &str, width: f64, height: f64) -> Result<Self, ClientError> {
        let backend = Arc::new(HttpBackend::new(config)?);
        let auth = login(&*backend, &AuthStore::new(&config.state_dir), username, Utc::now()).await?;

        let source = Arc::new(HttpShapeSource::new(config)?);
        let users = ChangeLog::<User>::connect(Arc::clone(&source), config.retry.clone()).await?;
        let cells = match ChangeLog::<Cell>::connect(source, config.retry.clone()).await {
            Ok(cells) => cells,
            Err(e) => {
                users.shutdown();
                return Err(e);
            }
        };

        let directory = UserDirectory::new();
        let grid = GridStore::new();
        let appliers = vec![directory.follow(&users), grid.follow(&cells)];

        let views = ViewStateStore::new(&config.state_dir);
        let view = match views.load(&auth.user_id).await {
            Ok(view) => view.unwrap_or_default(),
            Err(e) => {
                warn!("Could not load saved view for {}: {}", auth.user_id, e);
                Default::default()
            }
        };
        let viewport = Viewport::new(width, height).with_view(view);
        let saver = DebouncedViewSaver::spawn(views, auth.user_id.clone(), viewport.view_state(), config.save_debounce);

        let coordinator = Arc::new(WriteCoordinator::new(backend, grid, cells.clone(), config.match_timeout));
        let color = Color::parse(DEFAULT_COLOR)?;
        let canvas = Canvas::new(viewport, coordinator, directory, auth.user_id.clone(), color).with_saver(saver);

        info!("Session started for {} ({})", auth.username, auth.user_id);
        Ok(Self {
            auth,
            users,
            cells,
            canvas,
            appliers,
        })
    }

    pub fn auth(&self) -> &AuthRecord {
        &self.auth
    }

    pub fn canvas(&self) -> &Canvas<HttpBackend> {
        &self.canvas
    }

    pub fn canvas_mut(&mut self) -> &mut Canvas<HttpBackend> {
        &mut self.canvas
    }

    pub fn users(&self) -> &ChangeLog<User> {
        &self.users
    }

    pub fn cells(&self) -> &ChangeLog<Cell> {
        &self.cells
    }

    /// Connection status of the cells log, which drives the canvas.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.cells.status()
    }

    /// Save the view, stop both logs and wait for the appliers to finish.
    pub async fn shutdown(self) {
        let Self {
            auth,
            users,
            cells,
            canvas,
            appliers,
        } = self;

        canvas.close().await;
        users.shutdown();
        cells.shutdown();
        for task in appliers {
            let _ = task.await;
        }
        info!("Session for {} closed", auth.username);
    }
}
