use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use pixel_types::{LogOffset, Table};

/// Publishes the head of each table's change log so long-polling subscribers
/// wake up as soon as a commit lands.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    users: watch::Sender<LogOffset>,
    cells: watch::Sender<LogOffset>,
}

impl Dispatcher {
    /// Start from the heads currently in storage.
    pub fn new(users_head: LogOffset, cells_head: LogOffset) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                users: watch::Sender::new(users_head),
                cells: watch::Sender::new(cells_head),
            }),
        }
    }

    fn sender(&self, table: Table) -> &watch::Sender<LogOffset> {
        match table {
            Table::Users => &self.inner.users,
            Table::Cells => &self.inner.cells,
        }
    }

    /// Record a commit. Heads only move forward; stale notices are ignored.
    pub fn committed(&self, table: Table, offset: LogOffset) {
        self.sender(table).send_if_modified(|head| {
            if offset > *head {
                *head = offset;
                true
            } else {
                false
            }
        });
    }

    pub fn head(&self, table: Table) -> LogOffset {
        *self.sender(table).borrow()
    }

    pub fn subscribe(&self, table: Table) -> watch::Receiver<LogOffset> {
        self.sender(table).subscribe()
    }

    /// Wait until `table` has an entry past `after`, or `timeout` elapses.
    /// Returns whether new entries are available.
    pub async fn wait_past(&self, table: Table, after: LogOffset, timeout: Duration) -> bool {
        let mut rx = self.subscribe(table);
        let waited = tokio::time::timeout(timeout, rx.wait_for(|head| *head > after)).await;
        matches!(waited, Ok(Ok(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heads_only_move_forward() {
        let dispatcher = Dispatcher::new(LogOffset(0), LogOffset(4));
        dispatcher.committed(Table::Cells, LogOffset(9));
        dispatcher.committed(Table::Cells, LogOffset(7));
        assert_eq!(dispatcher.head(Table::Cells), LogOffset(9));
        assert_eq!(dispatcher.head(Table::Users), LogOffset(0));
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_past() {
        let dispatcher = Dispatcher::new(LogOffset(3), LogOffset(0));
        assert!(dispatcher.wait_past(Table::Users, LogOffset(2), Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_wakes_on_commit() {
        let dispatcher = Dispatcher::new(LogOffset(0), LogOffset(0));
        let waiter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.wait_past(Table::Cells, LogOffset(0), Duration::from_secs(20)).await
            })
        };

        tokio::task::yield_now().await;
        dispatcher.committed(Table::Users, LogOffset(1));
        dispatcher.committed(Table::Cells, LogOffset(2));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_commits() {
        let dispatcher = Dispatcher::new(LogOffset(5), LogOffset(5));
        assert!(!dispatcher.wait_past(Table::Cells, LogOffset(5), Duration::from_secs(20)).await);
    }
}
