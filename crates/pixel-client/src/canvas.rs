//! The interactive canvas: input handling, hover details and the draw list.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tracing::debug;

use pixel_types::{Cell, CellKey, Color, UserId};

use crate::backend::WriteBackend;
use crate::coordinator::WriteCoordinator;
use crate::directory::UserDirectory;
use crate::error::ClientError;
use crate::grid::GridStore;
use crate::view_state::DebouncedViewSaver;
use crate::viewport::{ScreenPoint, ScreenRect, Viewport, WorldRect};

pub const BACKGROUND: &str = "#FFFFFF";
pub const UNKNOWN_USER: &str = "Unknown";

/// Tooltip placement relative to the pointer.
const TOOLTIP_OFFSET: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct HoverInfo {
    pub key: CellKey,
    pub color: Color,
    pub username: String,
    pub last_updated: DateTime<Utc>,
    pub age: TimeDelta,
    pub tooltip_at: ScreenPoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawCell {
    pub key: CellKey,
    pub color: Color,
    pub rect: ScreenRect,
}

/// Everything needed to paint one frame: a blank background, grid lines every
/// `grid_step` pixels and the visible cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub background: &'static str,
    pub visible: WorldRect,
    pub grid_step: f64,
    pub cells: Vec<DrawCell>,
}

pub struct Canvas<B> {
    viewport: Viewport,
    coordinator: Arc<WriteCoordinator<B>>,
    directory: UserDirectory,
    user_id: UserId,
    color: Color,
    saver: Option<DebouncedViewSaver>,
}

impl<B: WriteBackend> Canvas<B> {
    pub fn new(
        viewport: Viewport,
        coordinator: Arc<WriteCoordinator<B>>,
        directory: UserDirectory,
        user_id: UserId,
        color: Color,
    ) -> Self {
        Self {
            viewport,
            coordinator,
            directory,
            user_id,
            color,
            saver: None,
        }
    }

    /// Persist view changes through `saver`.
    pub fn with_saver(mut self, saver: DebouncedViewSaver) -> Self {
        self.saver = Some(saver);
        self
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn grid(&self) -> &GridStore {
        self.coordinator.grid()
    }

    pub fn directory(&self) -> &UserDirectory {
        &self.directory
    }

    pub fn color(&self) -> &Color {
        &self.color
    }

    pub fn select_color(&mut self, color: Color) {
        self.color = color;
    }

    /// Paint the cell under the pointer with the selected color. The cell
    /// shows at once; the handle resolves when the write is settled.
    pub fn click(&self, sx: f64, sy: f64) -> Option<JoinHandle<Result<Cell, ClientError>>> {
        let key = self.viewport.hit_test(sx, sy)?;
        let cell = Cell::new(key, self.color.clone(), self.user_id.clone(), Utc::now());
        debug!("Painting {} {}", key, cell.color);
        Some(self.coordinator.submit(cell))
    }

    /// Pointer moved by `(dx, dy)` with the button held.
    pub fn drag(&mut self, dx: f64, dy: f64) {
        self.viewport.pan(-dx, -dy);
        self.view_changed();
    }

    pub fn wheel(&mut self, delta_y: f64, pointer: ScreenPoint) {
        self.viewport.wheel(delta_y, pointer);
        self.view_changed();
    }

    pub fn resize(&mut self, width: f64, height: f64) {
        self.viewport.resize(width, height);
    }

    /// Details of the painted cell under the pointer, if any.
    pub fn hover(&self, sx: f64, sy: f64, now: DateTime<Utc>) -> Option<HoverInfo> {
        let key = self.viewport.hit_test(sx, sy)?;
        let cell = self.grid().get(key)?;
        let username = self
            .directory
            .username(&cell.user_id)
            .unwrap_or_else(|| UNKNOWN_USER.to_string());

        Some(HoverInfo {
            key,
            color: cell.color,
            username,
            last_updated: cell.last_updated,
            age: now - cell.last_updated,
            tooltip_at: ScreenPoint::new(sx + TOOLTIP_OFFSET, sy + TOOLTIP_OFFSET),
        })
    }

    pub fn frame(&self) -> Frame {
        let visible = self.viewport.visible_rect();
        let cells = self
            .grid()
            .visible_cells(&visible)
            .into_iter()
            .map(|cell| {
                let key = cell.key();
                DrawCell {
                    key,
                    rect: self.viewport.cell_screen_rect(key),
                    color: cell.color,
                }
            })
            .collect();

        Frame {
            background: BACKGROUND,
            visible,
            grid_step: self.viewport.scale(),
            cells,
        }
    }

    /// Save the current view and stop the saver.
    pub async fn close(self) {
        if let Some(saver) = self.saver {
            saver.update(self.viewport.view_state());
            saver.flush().await;
        }
    }

    fn view_changed(&self) {
        if let Some(saver) = &self.saver {
            saver.update(self.viewport.view_state());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pixel_types::Operation;

    use super::*;
    use crate::change_log::ChangeLog;
    use crate::config::RetryPolicy;
    use crate::testing::{EchoBackend, Script, cell, change, scripted, ts, up_to_date, user};
    use crate::view_state::ViewStateStore;

    struct Fixture {
        canvas: Canvas<EchoBackend>,
        script: Script,
    }

    async fn fixture(cells: Vec<Cell>) -> Fixture {
        let (source, script) = scripted();
        let head = cells.len() as u64;
        let mut batch: Vec<_> = cells
            .into_iter()
            .enumerate()
            .map(|(i, c)| change(i as u64 + 1, Operation::Insert, c))
            .collect();
        batch.push(up_to_date(head));
        script.batch("h1", head, batch);

        let log = ChangeLog::<Cell>::connect(source, RetryPolicy::default()).await.unwrap();
        let grid = GridStore::new();
        grid.follow(&log);
        while !grid.is_loaded() {
            tokio::task::yield_now().await;
        }

        let directory = UserDirectory::new();
        directory.apply(&pixel_types::ChangeMessage::upsert(
            pixel_types::LogOffset(1),
            Operation::Insert,
            user("u1", "ada", 1),
        ));

        let coordinator = Arc::new(WriteCoordinator::new(
            Arc::new(EchoBackend::default()),
            grid,
            log,
            Duration::from_secs(10),
        ));
        let canvas = Canvas::new(
            Viewport::new(200.0, 100.0),
            coordinator,
            directory,
            UserId::new("u1"),
            Color::parse("#000000").unwrap(),
        );
        Fixture { canvas, script }
    }

    #[tokio::test]
    async fn click_paints_selected_color() {
        let mut f = fixture(vec![]).await;
        f.canvas.select_color(Color::parse("#FF00FF").unwrap());

        let handle = f.canvas.click(25.0, 5.0).unwrap();
        let key = CellKey::new(2, 0);
        assert_eq!(f.canvas.grid().get(key).unwrap().color.as_str(), "#FF00FF");
        assert!(f.canvas.click(250.0, 5.0).is_none());

        let pending = f.canvas.grid().pending(key).unwrap();
        f.script
            .batch("h1", 1, vec![change(1, Operation::Insert, pending), up_to_date(1)]);
        let confirmed = handle.await.unwrap().unwrap();
        assert_eq!(confirmed.key(), key);
        assert_eq!(f.canvas.grid().pending_count(), 0);
    }

    #[tokio::test]
    async fn hover_names_the_painter() {
        let f = fixture(vec![cell(0, 0, "#FF0000", "u1", 0), cell(1, 0, "#00FF00", "ghost", 0)]).await;

        let info = f.canvas.hover(3.0, 3.0, ts(90)).unwrap();
        assert_eq!(info.key, CellKey::new(0, 0));
        assert_eq!(info.username, "ada");
        assert_eq!(info.age, TimeDelta::seconds(90));
        assert_eq!(info.tooltip_at, ScreenPoint::new(13.0, 13.0));

        assert_eq!(f.canvas.hover(13.0, 3.0, ts(0)).unwrap().username, UNKNOWN_USER);
        assert!(f.canvas.hover(23.0, 3.0, ts(0)).is_none());
    }

    #[tokio::test]
    async fn frame_draws_visible_cells_only() {
        let mut f = fixture(vec![
            cell(0, 0, "#FF0000", "u1", 0),
            cell(5, 5, "#00FF00", "u1", 0),
            cell(100, 0, "#0000FF", "u1", 0),
        ])
        .await;
        f.canvas.drag(10.0, 0.0);

        let frame = f.canvas.frame();
        assert_eq!(frame.background, BACKGROUND);
        assert_eq!(frame.grid_step, 10.0);
        assert_eq!(frame.visible.min_x, -1);
        let keys: Vec<_> = frame.cells.iter().map(|c| c.key).collect();
        assert_eq!(keys, vec![CellKey::new(0, 0), CellKey::new(5, 5)]);
        assert_eq!(
            frame.cells[1].rect,
            ScreenRect {
                x: 60.0,
                y: 50.0,
                size: 10.0
            }
        );
    }

    #[tokio::test]
    async fn view_changes_are_saved_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = ViewStateStore::new(dir.path());
        let f = fixture(vec![]).await;
        let saver = DebouncedViewSaver::spawn(
            store.clone(),
            UserId::new("u1"),
            f.canvas.viewport().view_state(),
            Duration::from_secs(60),
        );
        let mut canvas = f.canvas.with_saver(saver);

        canvas.drag(30.0, -20.0);
        canvas.wheel(-1000.0, ScreenPoint::new(0.0, 0.0));
        let expected = canvas.viewport().view_state();
        canvas.close().await;

        assert_eq!(store.load(&UserId::new("u1")).await.unwrap(), Some(expected));
        assert_eq!(expected.zoom, 2.0);
    }
}
