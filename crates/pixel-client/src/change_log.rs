//! Client side of the change log.
//!
//! A [`ChangeLog`] owns one upstream connection per table. It fetches a
//! snapshot, then tails the log with long polls, and fans every message out to
//! any number of [`Subscription`]s. The current generation is retained so a new
//! subscription first replays everything seen so far and then continues live,
//! with nothing lost or reordered in between.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::Stream;
use reqwest::StatusCode;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pixel_types::events::{SHAPE_HANDLE_HEADER, SHAPE_OFFSET_HEADER};
use pixel_types::{ChangeMessage, Control, LogOffset, Operation, ShapeMessage, ShapeRow, Table};

use crate::config::{ClientConfig, RetryPolicy};
use crate::error::{ClientError, ConnectionError};

const CHANNEL_CAPACITY: usize = 1024;
const COMPACT_THRESHOLD: usize = 4096;

// -- Upstream --

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    pub table: Table,
    /// `None` asks for a snapshot.
    pub offset: Option<LogOffset>,
    pub handle: Option<String>,
    pub live: bool,
}

#[derive(Debug, Clone)]
pub struct ShapeResponse<R: ShapeRow> {
    pub handle: String,
    /// Last offset covered by this response.
    pub offset: LogOffset,
    pub messages: Vec<ShapeMessage<R>>,
}

/// Where change-log batches come from.
#[async_trait]
pub trait ShapeSource: Send + Sync + 'static {
    async fn fetch<R: ShapeRow>(&self, request: &ShapeRequest) -> Result<ShapeResponse<R>, ConnectionError>;
}

/// Long-polls `GET {shape_url}/v1/shape`.
pub struct HttpShapeSource {
    client: reqwest::Client,
    url: String,
    source_id: String,
    secret: String,
}

impl HttpShapeSource {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}/v1/shape", config.shape_url.trim_end_matches('/')),
            source_id: config.source_id.clone(),
            secret: config.source_secret.clone(),
        })
    }
}

#[async_trait]
impl ShapeSource for HttpShapeSource {
    async fn fetch<R: ShapeRow>(&self, request: &ShapeRequest) -> Result<ShapeResponse<R>, ConnectionError> {
        let offset = request.offset.map_or(-1, |o| o.0 as i64);
        let mut query = vec![
            ("table", request.table.as_str().to_string()),
            ("offset", offset.to_string()),
            ("source_id", self.source_id.clone()),
        ];
        if let Some(handle) = &request.handle {
            query.push(("handle", handle.clone()));
        }
        if request.live {
            query.push(("live", "true".into()));
        }

        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(&self.secret)
            .query(&query)
            .send()
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        // 409 carries a must-refetch body, handled like any other batch.
        match resp.status() {
            StatusCode::OK | StatusCode::CONFLICT => {}
            StatusCode::UNAUTHORIZED => return Err(ConnectionError::Unauthorized),
            StatusCode::NOT_FOUND => return Err(ConnectionError::NotFound),
            status => return Err(ConnectionError::Status(status.as_u16())),
        }

        let handle = header(&resp, SHAPE_HANDLE_HEADER)?.to_string();
        let offset = header(&resp, SHAPE_OFFSET_HEADER)?
            .parse::<u64>()
            .map(LogOffset)
            .map_err(|e| ConnectionError::Decode(format!("{SHAPE_OFFSET_HEADER}: {e}")))?;
        let messages = resp
            .json::<Vec<ShapeMessage<R>>>()
            .await
            .map_err(|e| ConnectionError::Decode(e.to_string()))?;

        Ok(ShapeResponse {
            handle,
            offset,
            messages,
        })
    }
}

fn header<'a>(resp: &'a reqwest::Response, name: &str) -> Result<&'a str, ConnectionError> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ConnectionError::Decode(format!("missing {name} header")))
}

// -- Events --

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent<R: ShapeRow> {
    Change(ChangeMessage<R>),
    /// Everything committed up to this offset has been delivered.
    UpToDate(LogOffset),
    /// Drop all state derived from earlier events; a fresh replay follows.
    Reset,
    /// The log gave up reconnecting. No further events follow.
    Failed(ConnectionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Live,
    Reconnecting { attempt: u32 },
    Failed(ConnectionError),
}

// -- Retained generation --

struct LogState<R: ShapeRow> {
    handle: Option<String>,
    cursor: Option<LogOffset>,
    up_to_date: Option<LogOffset>,
    /// Shared with subscriptions still replaying; appends copy it only then.
    messages: Arc<Vec<ChangeMessage<R>>>,
    compact_at: usize,
    failed: Option<ConnectionError>,
}

impl<R: ShapeRow> LogState<R> {
    fn new() -> Self {
        Self {
            handle: None,
            cursor: None,
            up_to_date: None,
            messages: Arc::default(),
            compact_at: COMPACT_THRESHOLD,
            failed: None,
        }
    }

    fn replay(&self) -> Replay<R> {
        let mut tail = VecDeque::new();
        if let Some(offset) = self.up_to_date {
            tail.push_back(LogEvent::UpToDate(offset));
        }
        if let Some(error) = &self.failed {
            tail.push_back(LogEvent::Failed(error.clone()));
        }
        Replay {
            messages: Arc::clone(&self.messages),
            next: 0,
            tail,
        }
    }

    fn push(&mut self, change: ChangeMessage<R>) {
        Arc::make_mut(&mut self.messages).push(change);
        if self.messages.len() >= self.compact_at {
            self.compact();
        }
    }

    /// Keep only the latest message per key, dropping keys whose latest
    /// message is a delete. Replays start from empty state, so the result
    /// rebuilds the same view.
    fn compact(&mut self) {
        let before = self.messages.len();
        let mut latest: HashMap<R::Key, usize> = HashMap::with_capacity(before);
        for (i, message) in self.messages.iter().enumerate() {
            latest.insert(message.key.clone(), i);
        }

        let mut index = 0;
        Arc::make_mut(&mut self.messages).retain(|message| {
            let keep = latest.get(&message.key) == Some(&index) && message.operation != Operation::Delete;
            index += 1;
            keep
        });

        self.compact_at = (self.messages.len() * 2).max(COMPACT_THRESHOLD);
        debug!("Compacted {} change log from {} to {} messages", R::TABLE, before, self.messages.len());
    }

    fn reset(&mut self) {
        self.handle = None;
        self.cursor = None;
        self.up_to_date = None;
        self.messages = Arc::default();
        self.compact_at = COMPACT_THRESHOLD;
    }
}

// -- ChangeLog --

struct Shared<R: ShapeRow> {
    state: Mutex<LogState<R>>,
    events: broadcast::Sender<LogEvent<R>>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

/// One table's change log. Cloning shares the same upstream connection.
pub struct ChangeLog<R: ShapeRow> {
    shared: Arc<Shared<R>>,
}

impl<R: ShapeRow> Clone for ChangeLog<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: ShapeRow> ChangeLog<R> {
    /// Fetch the snapshot, retrying up to `retry.connect_attempts` times, then
    /// start tailing in the background.
    pub async fn connect<S: ShapeSource>(source: Arc<S>, retry: RetryPolicy) -> Result<Self, ClientError> {
        let log = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState::new()),
                events: broadcast::channel(CHANNEL_CAPACITY).0,
                status: watch::Sender::new(ConnectionStatus::Connecting),
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
            }),
        };

        let request = log.next_request();
        let budget = retry.connect_attempts.max(1);
        let mut attempt = 0;
        let snapshot = loop {
            attempt += 1;
            match source.fetch::<R>(&request).await {
                Ok(resp) => break resp,
                Err(e) => {
                    let fatal = matches!(e, ConnectionError::Unauthorized | ConnectionError::NotFound);
                    if fatal || attempt >= budget {
                        warn!("Could not load {} change log after {} attempts: {}", R::TABLE, attempt, e);
                        log.shared.status.send_replace(ConnectionStatus::Failed(e.clone()));
                        return Err(e.into());
                    }
                    debug!("{} snapshot attempt {} failed: {}", R::TABLE, attempt, e);
                    tokio::time::sleep(retry.backoff(attempt)).await;
                }
            }
        };

        log.ingest(snapshot);
        info!("{} change log loaded ({} rows)", R::TABLE, log.buffered());

        tokio::spawn(log.clone().run(source, retry));
        Ok(log)
    }

    /// Start a subscription: the retained generation first, then live events.
    pub fn subscribe(&self) -> Subscription<R> {
        let state = self.lock();
        Subscription {
            replay: state.replay(),
            events: self.shared.events.subscribe(),
            log: self.clone(),
        }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.lock().up_to_date.is_some()
    }

    pub fn handle(&self) -> Option<String> {
        self.lock().handle.clone()
    }

    /// Messages retained for replay.
    pub fn buffered(&self) -> usize {
        self.lock().messages.len()
    }

    /// Stop polling. Subscriptions end once they drain what they already hold.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Resolves when the poller has stopped, through shutdown or failure.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    fn lock(&self) -> MutexGuard<'_, LogState<R>> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_request(&self) -> ShapeRequest {
        let state = self.lock();
        ShapeRequest {
            table: R::TABLE,
            offset: state.cursor,
            handle: state.handle.clone(),
            live: state.up_to_date.is_some(),
        }
    }

    async fn run<S: ShapeSource>(self, source: Arc<S>, retry: RetryPolicy) {
        let shared = Arc::clone(&self.shared);
        let mut failures = 0u32;

        loop {
            let request = self.next_request();
            let result = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                result = source.fetch::<R>(&request) => result,
            };

            match result {
                Ok(resp) => {
                    if failures > 0 {
                        info!("{} change log reconnected after {} failed polls", R::TABLE, failures);
                    }
                    failures = 0;
                    self.ingest(resp);
                }
                Err(e) => {
                    failures += 1;
                    if retry.reconnect_attempts.is_some_and(|max| failures > max) {
                        warn!("Giving up on {} change log after {} failed polls: {}", R::TABLE, failures, e);
                        self.fail(e);
                        break;
                    }

                    warn!("{} change log poll failed (attempt {}): {}", R::TABLE, failures, e);
                    shared.status.send_replace(ConnectionStatus::Reconnecting { attempt: failures });
                    tokio::select! {
                        _ = shared.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(retry.backoff(failures)) => {}
                    }
                }
            }
        }

        shared.closed.cancel();
        debug!("{} change log poller stopped", R::TABLE);
    }

    /// Apply one upstream batch and fan it out. Runs under the state lock so a
    /// concurrent `subscribe` sees either all of it in the replay or all of it
    /// live.
    fn ingest(&self, resp: ShapeResponse<R>) {
        let mut state = self.lock();
        let mut delivered = 0usize;
        let mut caught_up = None;

        for message in resp.messages {
            match message {
                ShapeMessage::Change(change) => {
                    // Redelivered after a reconnect.
                    if state.cursor.is_some_and(|cursor| change.offset <= cursor) {
                        continue;
                    }
                    state.push(change.clone());
                    let _ = self.shared.events.send(LogEvent::Change(change));
                    delivered += 1;
                }
                ShapeMessage::Control(control) => match control.control {
                    Control::UpToDate => caught_up = Some(control.offset),
                    Control::MustRefetch => {
                        info!(
                            "{} change log must refetch; dropping {} retained messages",
                            R::TABLE,
                            state.messages.len()
                        );
                        state.reset();
                        let _ = self.shared.events.send(LogEvent::Reset);
                        self.shared.status.send_replace(ConnectionStatus::Connecting);
                        return;
                    }
                },
            }
        }

        let cursor = state.cursor.map_or(resp.offset, |c| c.max(resp.offset));
        state.cursor = Some(cursor);
        state.handle = Some(resp.handle);

        let was_up_to_date = state.up_to_date.is_some();
        state.up_to_date = caught_up;
        if let Some(offset) = caught_up {
            if delivered > 0 || !was_up_to_date {
                let _ = self.shared.events.send(LogEvent::UpToDate(offset));
            }
        }

        self.shared.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Live {
                false
            } else {
                *status = ConnectionStatus::Live;
                true
            }
        });
    }

    fn fail(&self, error: ConnectionError) {
        let mut state = self.lock();
        state.failed = Some(error.clone());
        let _ = self.shared.events.send(LogEvent::Failed(error.clone()));
        self.shared.status.send_replace(ConnectionStatus::Failed(error));
    }
}

// -- Subscription --

/// Events a subscription owes before going live. Retained messages are
/// cloned one at a time as they are handed out.
struct Replay<R: ShapeRow> {
    messages: Arc<Vec<ChangeMessage<R>>>,
    next: usize,
    tail: VecDeque<LogEvent<R>>,
}

impl<R: ShapeRow> Replay<R> {
    fn remaining(&self) -> usize {
        self.messages.len() - self.next + self.tail.len()
    }

    fn pop(&mut self) -> Option<LogEvent<R>> {
        if let Some(message) = self.messages.get(self.next).cloned() {
            self.next += 1;
            if self.next == self.messages.len() {
                // Release the shared buffer so the log can append in place.
                self.messages = Arc::default();
                self.next = 0;
            }
            return Some(LogEvent::Change(message));
        }
        self.tail.pop_front()
    }
}

pub struct Subscription<R: ShapeRow> {
    log: ChangeLog<R>,
    replay: Replay<R>,
    events: broadcast::Receiver<LogEvent<R>>,
}

impl<R: ShapeRow> Subscription<R> {
    /// Replayed events not yet handed out.
    pub fn replay_remaining(&self) -> usize {
        self.replay.remaining()
    }

    /// Next event, or `None` once the log has stopped and everything
    /// already delivered to this subscription has been drained.
    pub async fn next(&mut self) -> Option<LogEvent<R>> {
        if let Some(event) = self.replay.pop() {
            return Some(event);
        }

        let received = tokio::select! {
            biased;
            received = self.events.recv() => received,
            _ = self.log.shared.closed.cancelled() => return None,
        };

        match received {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("{} subscriber fell {} events behind; replaying", R::TABLE, missed);
                let state = self.log.lock();
                self.events = self.log.shared.events.subscribe();
                self.replay = state.replay();
                Some(LogEvent::Reset)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = LogEvent<R>> {
        async_stream::stream! {
            while let Some(event) = self.next().await {
                yield event;
            }
        }
    }
}
