//! Per-user pan and zoom, kept in one JSON map on disk.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pixel_types::UserId;

use crate::error::ClientError;
use crate::viewport::ViewState;

const FILE_NAME: &str = "view_state.json";

#[derive(Debug, Clone)]
pub struct ViewStateStore {
    path: PathBuf,
}

impl ViewStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(FILE_NAME),
        }
    }

    pub async fn load(&self, user: &UserId) -> Result<Option<ViewState>, ClientError> {
        Ok(self.read_all().await?.get(user.as_str()).copied())
    }

    pub async fn save(&self, user: &UserId, view: ViewState) -> Result<(), ClientError> {
        let mut states = self.read_all().await?;
        states.insert(user.as_str().to_string(), view);

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&states)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<BTreeMap<String, ViewState>, ClientError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(states) => Ok(states),
            Err(e) => {
                warn!("Ignoring unreadable view state file {}: {}", self.path.display(), e);
                Ok(BTreeMap::new())
            }
        }
    }
}

/// Saves the latest view once it has been left alone for the debounce period.
pub struct DebouncedViewSaver {
    tx: watch::Sender<ViewState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DebouncedViewSaver {
    pub fn spawn(store: ViewStateStore, user: UserId, initial: ViewState, debounce: Duration) -> Self {
        let (tx, rx) = watch::channel(initial);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(store, user, rx, cancel.clone(), debounce));
        Self { tx, cancel, task }
    }

    pub fn update(&self, view: ViewState) {
        self.tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    /// Write any unsaved view now and stop.
    pub async fn flush(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run(
    store: ViewStateStore,
    user: UserId,
    mut rx: watch::Receiver<ViewState>,
    cancel: CancellationToken,
    debounce: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }

        // Every further change restarts the quiet period.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(debounce) => break,
                changed = rx.changed() => if changed.is_err() { break },
            }
        }

        let view = *rx.borrow_and_update();
        persist(&store, &user, view).await;
        if cancel.is_cancelled() {
            return;
        }
    }

    if rx.has_changed().unwrap_or(false) {
        let view = *rx.borrow_and_update();
        persist(&store, &user, view).await;
    }
}

async fn persist(store: &ViewStateStore, user: &UserId, view: ViewState) {
    match store.save(user, view).await {
        Ok(()) => debug!("Saved view for {}: zoom {:.2}", user, view.zoom),
        Err(e) => warn!("Could not save view for {}: {}", user, e),
    }
}
