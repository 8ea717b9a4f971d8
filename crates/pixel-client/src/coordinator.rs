//! Optimistic cell writes.
//!
//! A write is shown at once through the grid's pending overlay. The durable
//! request then races a matcher watching the cells log for the write's own
//! commit. Whichever settles the write retires its pending entry: a match
//! hands the key over to confirmed state, a failed request rolls it back.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use pixel_types::{Cell, ChangeMessage, OperationSet};

use crate::backend::WriteBackend;
use crate::change_log::ChangeLog;
use crate::error::{ClientError, ConnectionError};
use crate::grid::{GridStore, WriteId};
use crate::matcher::Matcher;

type Predicate = Box<dyn FnMut(&ChangeMessage<Cell>) -> bool + Send>;

/// A write published to the grid whose outcome is still open.
struct InFlight {
    cell: Cell,
    write: WriteId,
    matcher: Matcher<Cell, Predicate>,
}

enum Race {
    Confirmed(Option<ChangeMessage<Cell>>),
    Written(Result<Cell, ClientError>),
}

pub struct WriteCoordinator<B> {
    backend: Arc<B>,
    grid: GridStore,
    cells: ChangeLog<Cell>,
    match_timeout: Duration,
}

impl<B: WriteBackend> WriteCoordinator<B> {
    pub fn new(backend: Arc<B>, grid: GridStore, cells: ChangeLog<Cell>, match_timeout: Duration) -> Self {
        Self {
            backend,
            grid,
            cells,
            match_timeout,
        }
    }

    pub fn grid(&self) -> &GridStore {
        &self.grid
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Write `cell` and wait until it is confirmed or has failed. Returns the
    /// confirmed row.
    pub async fn write(&self, cell: Cell) -> Result<Cell, ClientError> {
        let in_flight = self.begin(cell);
        self.complete(in_flight).await
    }

    /// Publish `cell` before returning and settle the write in the background.
    pub fn submit(self: &Arc<Self>, cell: Cell) -> JoinHandle<Result<Cell, ClientError>> {
        let in_flight = self.begin(cell);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.complete(in_flight).await })
    }

    fn begin(&self, cell: Cell) -> InFlight {
        let key = cell.key();
        let submitted = cell.last_updated;
        let write = self.grid.publish_pending(cell.clone());

        // An older row for the same key, e.g. from the snapshot, must not
        // count as this write's confirmation.
        let predicate: Predicate = Box::new(move |change: &ChangeMessage<Cell>| {
            change.key == key && change.value.as_ref().is_some_and(|v| v.last_updated >= submitted)
        });
        let matcher = Matcher::new(&self.cells, OperationSet::WRITES, predicate);

        InFlight { cell, write, matcher }
    }

    async fn complete(&self, in_flight: InFlight) -> Result<Cell, ClientError> {
        let InFlight {
            cell,
            write,
            mut matcher,
        } = in_flight;
        let key = cell.key();

        let request = self.backend.upsert_cell(&cell);
        tokio::pin!(request);

        let race = tokio::select! {
            biased;
            confirmed = matcher.resolve() => Race::Confirmed(confirmed),
            written = &mut request => Race::Written(written),
        };

        match race {
            Race::Confirmed(Some(change)) => {
                self.grid.confirm_and_retire(&change, write);
                debug!("{} confirmed at offset {} ahead of its response", key, change.offset);
                Ok(change.value.unwrap_or_else(|| cell.clone()))
            }
            Race::Confirmed(None) => {
                // The log stopped; only the request can settle this write.
                let written = request.await;
                self.grid.retire(key, write);
                match written {
                    Ok(_) => Err(ConnectionError::Closed.into()),
                    Err(e) => Err(e),
                }
            }
            Race::Written(Err(e)) => {
                matcher.abandon();
                self.grid.retire(key, write);
                warn!("Write to {} failed: {}", key, e);
                Err(e)
            }
            Race::Written(Ok(_)) => {
                let started = Instant::now();
                match matcher.resolve_within(self.match_timeout).await {
                    Some(change) => {
                        self.grid.confirm_and_retire(&change, write);
                        debug!("{} confirmed at offset {}", key, change.offset);
                        Ok(change.value.unwrap_or_else(|| cell.clone()))
                    }
                    None => {
                        self.grid.retire(key, write);
                        let waited = started.elapsed();
                        warn!("Write to {} accepted but unconfirmed after {:?}", key, waited);
                        Err(ClientError::Stalled { key, waited })
                    }
                }
            }
        }
    }
}
