//! The client's view of the canvas: confirmed cells from the change log with
//! optimistic writes laid over them.
//!
//! A pending entry masks the confirmed value for its key until the write that
//! placed it is retired. Each pending entry remembers which write placed it,
//! so retiring an older write never removes a newer one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pixel_types::{Cell, CellKey, ChangeMessage, LogOffset};

use crate::change_log::{ChangeLog, LogEvent};
use crate::viewport::WorldRect;

/// Identifies one optimistic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteId(u64);

struct Confirmed {
    /// `None` once deleted; the offset is kept so replays of older messages
    /// are still recognised.
    cell: Option<Cell>,
    offset: LogOffset,
}

struct Pending {
    write: WriteId,
    cell: Cell,
}

#[derive(PartialEq)]
enum Source {
    Confirmed,
    Pending,
    /// Pending value over a confirmed one.
    Masked,
}

#[derive(Default)]
struct GridState {
    confirmed: BTreeMap<CellKey, Confirmed>,
    pending: BTreeMap<CellKey, Pending>,
    loaded: bool,
}

impl GridState {
    fn apply(&mut self, change: &ChangeMessage<Cell>) -> bool {
        if self
            .confirmed
            .get(&change.key)
            .is_some_and(|existing| existing.offset >= change.offset)
        {
            return false;
        }
        self.confirmed.insert(
            change.key,
            Confirmed {
                cell: change.value.clone(),
                offset: change.offset,
            },
        );
        true
    }

    fn retire(&mut self, key: CellKey, write: WriteId) -> bool {
        match self.pending.get(&key) {
            Some(pending) if pending.write == write => {
                self.pending.remove(&key);
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct GridStore {
    state: Arc<RwLock<GridState>>,
    next_write: Arc<AtomicU64>,
}

impl GridStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, GridState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GridState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Pending overlay --

    /// Show `cell` immediately, replacing any earlier pending value for its key.
    pub fn publish_pending(&self, cell: Cell) -> WriteId {
        let write = WriteId(self.next_write.fetch_add(1, Ordering::Relaxed));
        self.write().pending.insert(cell.key(), Pending { write, cell });
        write
    }

    /// Drop the pending value for `key` if `write` still owns it.
    pub fn retire(&self, key: CellKey, write: WriteId) -> bool {
        self.write().retire(key, write)
    }

    /// Apply the confirming change and retire the write in one step, so the
    /// key never shows an older confirmed value in between.
    pub fn confirm_and_retire(&self, change: &ChangeMessage<Cell>, write: WriteId) {
        let mut state = self.write();
        state.apply(change);
        state.retire(change.key, write);
    }

    pub fn pending(&self, key: CellKey) -> Option<Cell> {
        self.read().pending.get(&key).map(|p| p.cell.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.read().pending.len()
    }

    // -- Confirmed state --

    /// Apply one change from the log. Returns false for a message already
    /// superseded at its key.
    pub fn apply(&self, change: &ChangeMessage<Cell>) -> bool {
        self.write().apply(change)
    }

    /// Forget confirmed state ahead of a fresh replay. Pending writes stay.
    pub fn reset_confirmed(&self) {
        let mut state = self.write();
        state.confirmed.clear();
        state.loaded = false;
    }

    pub fn confirmed(&self, key: CellKey) -> Option<Cell> {
        self.read().confirmed.get(&key).and_then(|c| c.cell.clone())
    }

    /// Whether the confirmed state has caught up with the log at least once.
    pub fn is_loaded(&self) -> bool {
        self.read().loaded
    }

    // -- Logical view --

    pub fn get(&self, key: CellKey) -> Option<Cell> {
        let state = self.read();
        match state.pending.get(&key) {
            Some(pending) => Some(pending.cell.clone()),
            None => state.confirmed.get(&key).and_then(|c| c.cell.clone()),
        }
    }

    /// Every painted cell inside `rect`, pending values first in priority,
    /// ordered by x then y.
    pub fn visible_cells(&self, rect: &WorldRect) -> Vec<Cell> {
        if rect.min_x > rect.max_x || rect.min_y > rect.max_y {
            return Vec::new();
        }
        let state = self.read();
        let mut cells = Vec::new();

        for x in rect.min_x..=rect.max_x {
            let column = CellKey::new(x, rect.min_y)..=CellKey::new(x, rect.max_y);
            let mut confirmed = state.confirmed.range(column.clone()).peekable();
            let mut pending = state.pending.range(column).peekable();

            loop {
                let next = match (confirmed.peek(), pending.peek()) {
                    (None, None) => break,
                    (Some(_), None) => Source::Confirmed,
                    (None, Some(_)) => Source::Pending,
                    (Some((c, _)), Some((p, _))) => match p.cmp(c) {
                        std::cmp::Ordering::Less => Source::Pending,
                        std::cmp::Ordering::Equal => Source::Masked,
                        std::cmp::Ordering::Greater => Source::Confirmed,
                    },
                };

                if next == Source::Masked {
                    confirmed.next();
                }
                if next == Source::Confirmed {
                    if let Some((_, c)) = confirmed.next() {
                        cells.extend(c.cell.clone());
                    }
                } else if let Some((_, p)) = pending.next() {
                    cells.push(p.cell.clone());
                }
            }
        }

        cells
    }

    /// Feed confirmed state from `log` until it stops.
    pub fn follow(&self, log: &ChangeLog<Cell>) -> JoinHandle<()> {
        let grid = self.clone();
        let mut subscription = log.subscribe();

        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                match event {
                    LogEvent::Change(change) => {
                        grid.apply(&change);
                    }
                    LogEvent::UpToDate(offset) => {
                        let mut state = grid.write();
                        if !state.loaded {
                            debug!("Canvas loaded at offset {} ({} cells)", offset, state.confirmed.len());
                        }
                        state.loaded = true;
                    }
                    LogEvent::Reset => grid.reset_confirmed(),
                    LogEvent::Failed(e) => warn!("Canvas stopped following the change log: {}", e),
                }
            }
            debug!("Canvas applier stopped");
        })
    }
}
