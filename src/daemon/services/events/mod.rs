//! Append-only event log and live change notification.
//!
//! Every mutation appends one [`Event`] keyed by a zero-padded millisecond
//! timestamp from the shared [`MonotonicClock`], so keys are unique and
//! sort in append order. After persisting, the event is handed to the
//! [`ChangeNotifier`] for live subscribers. The durable log is the catch-up
//! mechanism; live streams carry no replay.

mod notifier;

pub use notifier::{ChangeMessage, ChangeNotifier, PathFilter, Subscription};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::constants::SCAN_PAGE_SIZE;
use crate::daemon::services::clock::MonotonicClock;
use crate::daemon::store::{RangeQuery, Store, Table};
use crate::error::Result;

/// Kind of mutation recorded by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Put,
    Delete,
    Mkdir,
    Rmdir,
}

/// Whether an event concerns a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Zero-padded millisecond timestamp; also the log key.
    pub timestamp: String,
    pub operation: Operation,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl Event {
    /// Log key for a millisecond timestamp.
    pub fn key(timestamp_ms: i64) -> String {
        format!("{timestamp_ms:015}")
    }

    /// The timestamp as milliseconds.
    pub fn millis(&self) -> i64 {
        self.timestamp.parse().unwrap_or_default()
    }
}

/// Paging options for [`EventLog::list`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub limit: usize,
    pub cursor: Option<String>,
    pub reverse: bool,
    /// Only events caused by this owner.
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// The durable log plus its live fan-out.
#[derive(Clone)]
pub struct EventLog {
    store: Store,
    clock: Arc<MonotonicClock>,
    notifier: ChangeNotifier,
}

impl EventLog {
    pub fn new(store: Store, clock: Arc<MonotonicClock>, notifier: ChangeNotifier) -> Self {
        Self {
            store,
            clock,
            notifier,
        }
    }

    /// Largest timestamp already in the log, used to seed the clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn last_timestamp(store: &Store) -> Result<i64> {
        Ok(store
            .last_key(Table::Events)
            .await?
            .and_then(|key| key.parse().ok())
            .unwrap_or(0))
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Persist a new event, then publish it to live subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be persisted; nothing is
    /// published in that case.
    pub async fn append(
        &self,
        operation: Operation,
        path: &str,
        kind: EntryKind,
        owner: &str,
    ) -> Result<Event> {
        let event = Event {
            timestamp: Event::key(self.clock.next()),
            operation,
            path: path.to_string(),
            kind,
            owner: Some(owner.to_string()),
        };
        self.store
            .put_json(Table::Events, &event.timestamp, &event)
            .await?;
        debug!(operation = ?event.operation, path = %event.path, "Event appended");

        self.notifier.publish(&event);
        Ok(event)
    }

    /// Page through the log. The cursor is exclusive.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list(&self, query: &EventQuery) -> Result<EventPage> {
        let want = query.limit + 1;
        let mut events = Vec::new();
        let mut cursor = query.cursor.clone();

        // Owner filtering may discard entries, so keep reading until the
        // page is full or the log runs out.
        loop {
            let range = RangeQuery::prefix("")
                .after(cursor.clone())
                .reversed(query.reverse)
                .limit(SCAN_PAGE_SIZE);
            let batch: Vec<(String, Event)> = self.store.range_json(Table::Events, range).await?;
            let exhausted = batch.len() < SCAN_PAGE_SIZE;
            cursor = batch.last().map(|(key, _)| key.clone());

            events.extend(
                batch
                    .into_iter()
                    .map(|(_, event)| event)
                    .filter(|event| match &query.owner {
                        Some(owner) => event.owner.as_deref() == Some(owner.as_str()),
                        None => true,
                    }),
            );
            if events.len() >= want || exhausted {
                break;
            }
        }

        let has_more = events.len() > query.limit;
        events.truncate(query.limit);
        let next_cursor = if has_more {
            events.last().map(|e| e.timestamp.clone())
        } else {
            None
        };
        Ok(EventPage {
            events,
            next_cursor,
            has_more,
        })
    }

    /// Number of events at or after `since_ms`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn count_since(&self, since_ms: i64) -> Result<usize> {
        let mut count = 0;
        let mut cursor = Some(Event::key(since_ms.saturating_sub(1).max(0)));
        loop {
            let range = RangeQuery::prefix("").after(cursor.clone()).limit(SCAN_PAGE_SIZE);
            let batch = self.store.range(Table::Events, range).await?;
            count += batch.len();
            if batch.len() < SCAN_PAGE_SIZE {
                return Ok(count);
            }
            cursor = batch.last().map(|(key, _)| key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_log() -> EventLog {
        EventLog::new(
            Store::memory(),
            Arc::new(MonotonicClock::default()),
            ChangeNotifier::new(),
        )
    }

    #[tokio::test]
    async fn test_append_keys_strictly_increase() {
        let log = create_log();
        let a = log.append(Operation::Put, "/a", EntryKind::File, "alice").await.unwrap();
        let b = log.append(Operation::Put, "/a", EntryKind::File, "alice").await.unwrap();
        assert!(b.timestamp > a.timestamp);
        assert_eq!(a.timestamp.len(), 15);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_cursor() {
        let log = create_log();
        for path in ["/1", "/2", "/3"] {
            log.append(Operation::Put, path, EntryKind::File, "alice").await.unwrap();
        }

        let page = log
            .list(&EventQuery {
                limit: 2,
                reverse: true,
                ..EventQuery::default()
            })
            .await
            .unwrap();
        let paths: Vec<_> = page.events.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/3", "/2"]);
        assert!(page.has_more);

        let rest = log
            .list(&EventQuery {
                limit: 2,
                reverse: true,
                cursor: page.next_cursor,
                ..EventQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(rest.events.len(), 1);
        assert_eq!(rest.events[0].path, "/1");
        assert!(!rest.has_more);
        assert!(rest.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_owner() {
        let log = create_log();
        log.append(Operation::Mkdir, "/a/", EntryKind::Directory, "alice").await.unwrap();
        log.append(Operation::Put, "/b", EntryKind::File, "bob").await.unwrap();

        let page = log
            .list(&EventQuery {
                limit: 10,
                owner: Some("bob".into()),
                ..EventQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].path, "/b");
    }

    #[tokio::test]
    async fn test_append_publishes_to_subscribers() {
        let log = create_log();
        let mut sub = log.notifier().subscribe("s1", "alice", PathFilter::All);
        log.append(Operation::Delete, "/x", EntryKind::File, "alice").await.unwrap();

        assert_eq!(sub.receiver.recv().await.unwrap().kind, "connected");
        let msg = sub.receiver.recv().await.unwrap();
        assert_eq!(msg.operation, Some(Operation::Delete));
    }

    #[tokio::test]
    async fn test_event_json_shape() {
        let log = create_log();
        let event = log.append(Operation::Rmdir, "/d/", EntryKind::Directory, "alice").await.unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operation"], "RMDIR");
        assert_eq!(json["type"], "directory");
    }

    #[tokio::test]
    async fn test_count_since_and_seed() {
        let log = create_log();
        let first = log.append(Operation::Put, "/a", EntryKind::File, "alice").await.unwrap();
        let second = log.append(Operation::Put, "/b", EntryKind::File, "alice").await.unwrap();

        assert_eq!(log.count_since(0).await.unwrap(), 2);
        assert_eq!(log.count_since(second.millis()).await.unwrap(), 1);
        assert_eq!(log.count_since(second.millis() + 1).await.unwrap(), 0);
        assert_eq!(
            EventLog::last_timestamp(&log.store).await.unwrap(),
            second.millis()
        );
        assert!(first.millis() < second.millis());
    }
}
