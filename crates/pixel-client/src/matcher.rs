use std::time::Duration;

use pixel_types::{ChangeMessage, OperationSet, ShapeRow};

use crate::change_log::{ChangeLog, LogEvent, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    /// Checking messages the log already held when the matcher started.
    Subscribing,
    /// Tailing live messages.
    Watching,
    Matched,
    Abandoned,
}

/// Waits for the first change of one of `operations` that satisfies a
/// predicate. Resolves at most once; an unmatched wait ends in `None`, never
/// in an error.
pub struct Matcher<R: ShapeRow, P> {
    subscription: Option<Subscription<R>>,
    operations: OperationSet,
    predicate: P,
    state: MatchState,
}

impl<R, P> Matcher<R, P>
where
    R: ShapeRow,
    P: FnMut(&ChangeMessage<R>) -> bool + Send,
{
    /// Subscribes right away, so a change committed before this call is still
    /// found in the replayed snapshot.
    pub fn new(log: &ChangeLog<R>, operations: OperationSet, predicate: P) -> Self {
        Self {
            subscription: Some(log.subscribe()),
            operations,
            predicate,
            state: MatchState::Subscribing,
        }
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub async fn resolve(&mut self) -> Option<ChangeMessage<R>> {
        loop {
            let subscription = self.subscription.as_mut()?;
            self.state = if subscription.replay_remaining() > 0 {
                MatchState::Subscribing
            } else {
                MatchState::Watching
            };

            match subscription.next().await {
                Some(LogEvent::Change(change)) => {
                    if self.operations.contains(change.operation) && (self.predicate)(&change) {
                        self.state = MatchState::Matched;
                        self.subscription = None;
                        return Some(change);
                    }
                }
                Some(LogEvent::UpToDate(_) | LogEvent::Reset) => {}
                Some(LogEvent::Failed(_)) | None => {
                    self.abandon();
                    return None;
                }
            }
        }
    }

    /// `resolve` bounded by `timeout`; gives up on expiry.
    pub async fn resolve_within(&mut self, timeout: Duration) -> Option<ChangeMessage<R>> {
        match tokio::time::timeout(timeout, self.resolve()).await {
            Ok(found) => found,
            Err(_) => {
                self.abandon();
                None
            }
        }
    }

    pub fn abandon(&mut self) {
        if self.state != MatchState::Matched {
            self.state = MatchState::Abandoned;
        }
        self.subscription = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pixel_types::{Cell, CellKey, LogOffset, Operation};

    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::ConnectionError;
    use crate::testing::{Script, ScriptedSource, cell, change, delete_cell, scripted, up_to_date};

    async fn connected(initial: Vec<serde_json::Value>, head: u64) -> (ChangeLog<Cell>, Arc<ScriptedSource>, Script) {
        let (source, script) = scripted();
        let mut batch = initial;
        batch.push(up_to_date(head));
        script.batch("h1", head, batch);
        let log = ChangeLog::connect(source.clone(), RetryPolicy::default()).await.unwrap();
        (log, source, script)
    }

    fn at(key: CellKey) -> impl FnMut(&ChangeMessage<Cell>) -> bool + Send {
        move |m| m.key == key
    }

    #[tokio::test]
    async fn matches_message_already_in_snapshot() {
        let (log, _source, _script) =
            connected(vec![change(1, Operation::Insert, cell(5, -3, "#FF0000", "u1", 0))], 1).await;

        let mut matcher = Matcher::new(&log, OperationSet::WRITES, at(CellKey::new(5, -3)));
        assert_eq!(matcher.state(), MatchState::Subscribing);

        let found = matcher.resolve().await.unwrap();
        assert_eq!(found.offset, LogOffset(1));
        assert_eq!(found.value.unwrap().color.as_str(), "#FF0000");
        assert_eq!(matcher.state(), MatchState::Matched);
        assert!(matcher.resolve().await.is_none());
    }

    #[tokio::test]
    async fn waits_for_live_message_and_skips_other_operations() {
        let (log, _source, script) = connected(vec![], 0).await;
        let key = CellKey::new(2, 2);
        let mut matcher = Matcher::new(&log, OperationSet::WRITES, at(key));

        script.batch(
            "h1",
            3,
            vec![
                change(1, Operation::Insert, cell(9, 9, "#000000", "u1", 0)),
                delete_cell(2, 2, 2),
                change(3, Operation::Update, cell(2, 2, "#00FF00", "u1", 1)),
                up_to_date(3),
            ],
        );

        let found = matcher.resolve().await.unwrap();
        assert_eq!(found.offset, LogOffset(3));
        assert_eq!(found.operation, Operation::Update);
    }

    #[tokio::test]
    async fn concurrent_matchers_are_independent() {
        let (log, _source, script) = connected(vec![], 0).await;
        let mut first = Matcher::new(&log, OperationSet::WRITES, at(CellKey::new(0, 0)));
        let mut second = Matcher::new(&log, OperationSet::WRITES, at(CellKey::new(1, 1)));

        script.batch(
            "h1",
            2,
            vec![
                change(1, Operation::Insert, cell(1, 1, "#111111", "u2", 0)),
                change(2, Operation::Insert, cell(0, 0, "#000000", "u1", 0)),
                up_to_date(2),
            ],
        );

        let (a, b) = tokio::join!(first.resolve(), second.resolve());
        assert_eq!(a.unwrap().offset, LogOffset(2));
        assert_eq!(b.unwrap().offset, LogOffset(1));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_abandons() {
        let (log, _source, _script) = connected(vec![], 0).await;
        let mut matcher = Matcher::new(&log, OperationSet::WRITES, at(CellKey::new(7, 7)));

        assert!(matcher.resolve_within(Duration::from_secs(10)).await.is_none());
        assert_eq!(matcher.state(), MatchState::Abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn log_failure_abandons() {
        let (source, script) = scripted();
        script.batch("h1", 0, vec![up_to_date(0)]);
        let retry = RetryPolicy {
            reconnect_attempts: Some(0),
            ..RetryPolicy::default()
        };
        let log = ChangeLog::<Cell>::connect(source, retry).await.unwrap();
        let mut matcher = Matcher::new(&log, OperationSet::ALL, |_: &ChangeMessage<Cell>| true);

        script.fail(ConnectionError::Transport("down".into()));
        assert!(matcher.resolve().await.is_none());
        assert_eq!(matcher.state(), MatchState::Abandoned);
    }
}
