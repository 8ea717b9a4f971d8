use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pixel_types::{ChangeMessage, LogOffset, User, UserId};

use crate::change_log::{ChangeLog, LogEvent};

struct Entry {
    user: Option<User>,
    offset: LogOffset,
}

/// Users known from the users log, for resolving who painted a cell.
#[derive(Clone, Default)]
pub struct UserDirectory {
    users: Arc<RwLock<HashMap<UserId, Entry>>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one change. Returns `false` for messages at or below the offset
    /// already applied for that user.
    pub fn apply(&self, change: &ChangeMessage<User>) -> bool {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.get(&change.key).is_some_and(|e| e.offset >= change.offset) {
            return false;
        }
        users.insert(
            change.key.clone(),
            Entry {
                user: change.value.clone(),
                offset: change.offset,
            },
        );
        true
    }

    pub fn clear(&self) {
        self.users.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn get(&self, id: &UserId) -> Option<User> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        users.get(id).and_then(|e| e.user.clone())
    }

    pub fn username(&self, id: &UserId) -> Option<String> {
        self.get(id).map(|u| u.username)
    }

    pub fn len(&self) -> usize {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        users.values().filter(|e| e.user.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn follow(&self, log: &ChangeLog<User>) -> JoinHandle<()> {
        let directory = self.clone();
        let mut subscription = log.subscribe();

        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                match event {
                    LogEvent::Change(change) => {
                        directory.apply(&change);
                    }
                    LogEvent::UpToDate(_) => {}
                    LogEvent::Reset => directory.clear(),
                    LogEvent::Failed(e) => warn!("User directory stopped following the change log: {}", e),
                }
            }
            debug!("User directory applier stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use pixel_types::Operation;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::testing::{change, must_refetch, scripted, up_to_date, user};

    fn upsert(offset: u64, user: User) -> ChangeMessage<User> {
        ChangeMessage::upsert(LogOffset(offset), Operation::Insert, user)
    }

    #[test]
    fn replayed_messages_are_ignored() {
        let directory = UserDirectory::new();
        assert!(directory.apply(&upsert(2, user("u1", "ada", 3))));
        assert!(!directory.apply(&upsert(1, user("u1", "ada", 0))));
        assert_eq!(directory.get(&UserId::new("u1")).unwrap().pixels_placed, 3);

        assert!(directory.apply(&ChangeMessage::delete(LogOffset(3), UserId::new("u1"))));
        assert!(!directory.apply(&upsert(2, user("u1", "ada", 3))));
        assert_eq!(directory.username(&UserId::new("u1")), None);
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn follows_users_log() {
        let (source, script) = scripted();
        script.batch(
            "h1",
            2,
            vec![
                change(1, Operation::Insert, user("u1", "ada", 0)),
                change(2, Operation::Insert, user("u2", "bob", 0)),
                up_to_date(2),
            ],
        );
        let log = ChangeLog::<User>::connect(source, RetryPolicy::default()).await.unwrap();
        let directory = UserDirectory::new();
        let task = directory.follow(&log);

        script.batch("h1", 3, vec![change(3, Operation::Update, user("u1", "ada", 1)), up_to_date(3)]);
        while directory.get(&UserId::new("u1")).is_none_or(|u| u.pixels_placed == 0) {
            tokio::task::yield_now().await;
        }
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.username(&UserId::new("u2")).as_deref(), Some("bob"));

        script.batch("h2", 0, vec![must_refetch(0)]);
        script.batch("h2", 1, vec![change(1, Operation::Insert, user("u3", "cy", 0)), up_to_date(1)]);
        while directory.username(&UserId::new("u3")).is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(directory.len(), 1);

        log.shutdown();
        task.await.unwrap();
    }
}
