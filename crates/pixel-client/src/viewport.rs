//! Mapping between world cells and screen coordinates under pan and zoom.
//!
//! The grid is drawn aligned to whole cells: the cell at the top-left corner
//! of the canvas is `floor(offset / scale)`, where `scale = cell_size * zoom`
//! is the on-screen width of one cell.

use serde::{Deserialize, Serialize};

use pixel_types::CellKey;

pub const CELL_SIZE: f64 = 10.0;
pub const MIN_ZOOM: f64 = 0.1;
pub const MAX_ZOOM: f64 = 10.0;

/// Wheel sensitivity: one unit of wheel delta changes zoom by this fraction.
const WHEEL_FACTOR: f64 = 0.001;

/// Screen quotients this close to a grid line count as on it.
const SNAP_EPSILON: f64 = 1e-6;
/// Snap tolerance per cell of distance, for quotients far from zero.
const SNAP_RELATIVE: f64 = 1e-12;

fn clamp_coord(cells: i64) -> i32 {
    cells.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

impl ScreenPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Inclusive rectangle of world cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldRect {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl WorldRect {
    pub fn contains(&self, key: CellKey) -> bool {
        (self.min_x..=self.max_x).contains(&key.x) && (self.min_y..=self.max_y).contains(&key.y)
    }

    /// Columns spanned.
    pub fn width(&self) -> i64 {
        i64::from(self.max_x) - i64::from(self.min_x) + 1
    }

    pub fn height(&self) -> i64 {
        i64::from(self.max_y) - i64::from(self.min_y) + 1
    }
}

/// Where a cell is drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenRect {
    pub x: f64,
    pub y: f64,
    pub size: f64,
}

/// Pan and zoom, as persisted between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub offset: ScreenPoint,
    pub zoom: f64,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            offset: ScreenPoint::default(),
            zoom: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Viewport {
    offset: ScreenPoint,
    zoom: f64,
    width: f64,
    height: f64,
    cell_size: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            offset: ScreenPoint::default(),
            zoom: 1.0,
            width: width.max(0.0),
            height: height.max(0.0),
            cell_size: CELL_SIZE,
        }
    }

    pub fn with_view(mut self, view: ViewState) -> Self {
        self.restore(view);
        self
    }

    pub fn restore(&mut self, view: ViewState) {
        if view.offset.x.is_finite() && view.offset.y.is_finite() {
            self.offset = view.offset;
        }
        self.set_zoom(view.zoom);
    }

    pub fn view_state(&self) -> ViewState {
        ViewState {
            offset: self.offset,
            zoom: self.zoom,
        }
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn offset(&self) -> ScreenPoint {
        self.offset
    }

    pub fn size(&self) -> (f64, f64) {
        (self.width, self.height)
    }

    /// On-screen width of one cell.
    pub fn scale(&self) -> f64 {
        self.cell_size * self.zoom
    }

    // -- Interaction --

    pub fn pan(&mut self, dx: f64, dy: f64) {
        if dx.is_finite() && dy.is_finite() {
            self.offset.x += dx;
            self.offset.y += dy;
        }
    }

    /// Set zoom, clamped to `[MIN_ZOOM, MAX_ZOOM]`. Non-finite input is ignored.
    pub fn set_zoom(&mut self, zoom: f64) {
        if zoom.is_finite() {
            self.zoom = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
        }
    }

    /// Zoom to `zoom` keeping the world point under `pointer` in place.
    pub fn zoom_at(&mut self, zoom: f64, pointer: ScreenPoint) {
        if !zoom.is_finite() {
            return;
        }
        let old = self.zoom;
        self.set_zoom(zoom);
        let ratio = self.zoom / old;
        self.offset.x = (self.offset.x + pointer.x) * ratio - pointer.x;
        self.offset.y = (self.offset.y + pointer.y) * ratio - pointer.y;
    }

    /// Mouse wheel: positive `delta_y` zooms out.
    pub fn wheel(&mut self, delta_y: f64, pointer: ScreenPoint) {
        self.zoom_at(self.zoom * (1.0 - delta_y * WHEEL_FACTOR), pointer);
    }

    pub fn resize(&mut self, width: f64, height: f64) {
        self.width = width.max(0.0);
        self.height = height.max(0.0);
    }

    // -- Conversion --

    /// Whole cells spanned by `screen` units, floored.
    fn cells(&self, screen: f64) -> i64 {
        let q = screen / self.scale();
        let nearest = q.round();
        let tolerance = SNAP_EPSILON.max(q.abs() * SNAP_RELATIVE);
        let snapped = if (q - nearest).abs() < tolerance { nearest } else { q.floor() };
        snapped as i64
    }

    /// World cell drawn at the canvas' top-left corner, unclamped.
    fn origin(&self) -> (i64, i64) {
        (self.cells(self.offset.x), self.cells(self.offset.y))
    }

    pub fn to_world(&self, sx: f64, sy: f64) -> CellKey {
        let (ox, oy) = self.origin();
        CellKey::new(
            clamp_coord(self.cells(sx).saturating_add(ox)),
            clamp_coord(self.cells(sy).saturating_add(oy)),
        )
    }

    /// Top-left corner of `key` on screen.
    pub fn to_screen(&self, key: CellKey) -> ScreenPoint {
        let (ox, oy) = self.origin();
        let scale = self.scale();
        ScreenPoint::new(
            i64::from(key.x).saturating_sub(ox) as f64 * scale,
            i64::from(key.y).saturating_sub(oy) as f64 * scale,
        )
    }

    pub fn cell_screen_rect(&self, key: CellKey) -> ScreenRect {
        let corner = self.to_screen(key);
        ScreenRect {
            x: corner.x,
            y: corner.y,
            size: self.scale(),
        }
    }

    /// Cells that can appear on the canvas. Nothing outside is drawn or hit.
    pub fn visible_rect(&self) -> WorldRect {
        let (ox, oy) = self.origin();
        let scale = self.scale();
        let across = (self.width / scale).ceil() as i64;
        let down = (self.height / scale).ceil() as i64;
        WorldRect {
            min_x: clamp_coord(ox),
            min_y: clamp_coord(oy),
            max_x: clamp_coord(ox.saturating_add(across)),
            max_y: clamp_coord(oy.saturating_add(down)),
        }
    }

    pub fn is_visible(&self, key: CellKey) -> bool {
        self.visible_rect().contains(key)
    }

    /// Cell under a screen point, or `None` off the canvas.
    pub fn hit_test(&self, sx: f64, sy: f64) -> Option<CellKey> {
        let inside = (0.0..self.width).contains(&sx) && (0.0..self.height).contains(&sy);
        inside.then(|| self.to_world(sx, sy))
    }
}
