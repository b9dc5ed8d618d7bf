//! Live fan-out of new events to connected subscribers.
//!
//! The registry is in-memory only and keyed by session id: a session holds
//! at most one live subscription, and a new one replaces the old. Delivery
//! is best-effort. A full subscriber buffer drops the event for that
//! subscriber; a closed one is removed from the registry.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{EntryKind, Event, Operation};
use crate::constants::SUBSCRIBER_BUFFER;
use crate::utils::now_ms;

/// Which paths a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathFilter {
    All,
    /// Exactly this path.
    Exact(String),
    /// Everything under this prefix (parsed from `prefix/*`).
    Prefix(String),
}

impl PathFilter {
    /// Parse the `?path=` query value.
    ///
    /// `"/docs/*"` matches everything below `/docs/`; anything else must
    /// match exactly.
    pub fn parse(filter: Option<&str>) -> Self {
        match filter.filter(|f| !f.is_empty()) {
            None => PathFilter::All,
            Some(f) => match f.strip_suffix('*') {
                Some(prefix) if prefix.ends_with('/') => PathFilter::Prefix(prefix.to_string()),
                _ => PathFilter::Exact(f.to_string()),
            },
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathFilter::All => true,
            PathFilter::Exact(exact) => path == exact,
            PathFilter::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

/// One message on a live stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    pub timestamp: i64,
}

impl ChangeMessage {
    /// Greeting sent when a stream opens.
    pub fn connected() -> Self {
        Self {
            kind: "connected",
            path: None,
            operation: None,
            timestamp: now_ms(),
        }
    }

    fn from_event(event: &Event) -> Self {
        Self {
            kind: match event.kind {
                EntryKind::File => "file_change",
                EntryKind::Directory => "directory_change",
            },
            path: Some(event.path.clone()),
            operation: Some(event.operation),
            timestamp: event.millis(),
        }
    }
}

struct Subscriber {
    id: u64,
    owner: String,
    filter: PathFilter,
    sender: mpsc::Sender<ChangeMessage>,
}

#[derive(Default)]
struct Registry {
    subscribers: DashMap<String, Subscriber>,
    next_id: AtomicU64,
}

/// Shared handle to the subscriber registry.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    inner: Arc<Registry>,
}

/// A live subscription. Dropping it unregisters the subscriber.
pub struct Subscription {
    pub receiver: mpsc::Receiver<ChangeMessage>,
    registry: Arc<Registry>,
    session_id: String,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // A newer subscription for the same session must survive.
        self.registry
            .subscribers
            .remove_if(&self.session_id, |_, sub| sub.id == self.id);
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session_id` for events owned by `owner` matching `filter`.
    ///
    /// The returned receiver starts with a `connected` message.
    pub fn subscribe(&self, session_id: &str, owner: &str, filter: PathFilter) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        // Fresh channel with spare capacity; cannot fail.
        let _ = sender.try_send(ChangeMessage::connected());

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self.inner.subscribers.insert(
            session_id.to_string(),
            Subscriber {
                id,
                owner: owner.to_string(),
                filter,
                sender,
            },
        );
        if replaced.is_some() {
            debug!(session_id = %session_id, "Replaced existing event subscription");
        }

        Subscription {
            receiver,
            registry: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
            id,
        }
    }

    /// Deliver `event` to every matching subscriber without blocking.
    pub fn publish(&self, event: &Event) {
        let Some(owner) = event.owner.as_deref() else {
            return;
        };
        let message = ChangeMessage::from_event(event);
        let mut dead = Vec::new();

        for entry in self.inner.subscribers.iter() {
            let sub = entry.value();
            if sub.owner != owner || !sub.filter.matches(&event.path) {
                continue;
            }
            match sub.sender.try_send(message.clone()) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %entry.key(), path = %event.path, "Subscriber buffer full, dropping event");
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push((entry.key().clone(), sub.id));
                },
            }
        }

        // Removal happens after iteration; DashMap shards are still locked above.
        for (session_id, id) in dead {
            self.inner
                .subscribers
                .remove_if(&session_id, |_, sub| sub.id == id);
            debug!(session_id = %session_id, "Removed closed event subscriber");
        }
    }

    /// Number of live subscriptions.
    pub fn connection_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(path: &str, owner: &str) -> Event {
        Event {
            timestamp: Event::key(1_700_000_000_000),
            operation: Operation::Put,
            path: path.to_string(),
            kind: EntryKind::File,
            owner: Some(owner.to_string()),
        }
    }

    #[test]
    fn test_path_filter_parse() {
        assert_eq!(PathFilter::parse(None), PathFilter::All);
        assert_eq!(PathFilter::parse(Some("")), PathFilter::All);
        assert_eq!(
            PathFilter::parse(Some("/docs/*")),
            PathFilter::Prefix("/docs/".into())
        );
        assert_eq!(
            PathFilter::parse(Some("/docs/a.txt")),
            PathFilter::Exact("/docs/a.txt".into())
        );
    }

    #[test]
    fn test_prefix_filter_does_not_leak_to_siblings() {
        let filter = PathFilter::parse(Some("/docs/*"));
        assert!(filter.matches("/docs/a.txt"));
        assert!(filter.matches("/docs/sub/b.txt"));
        assert!(!filter.matches("/docs2/a.txt"));
    }

    #[tokio::test]
    async fn test_subscriber_receives_connected_then_matching_events() {
        let notifier = ChangeNotifier::new();
        let mut sub = notifier.subscribe("s1", "alice", PathFilter::parse(Some("/docs/*")));

        notifier.publish(&event("/docs/a.txt", "alice"));
        notifier.publish(&event("/other.txt", "alice"));
        notifier.publish(&event("/docs/b.txt", "bob"));

        assert_eq!(sub.receiver.recv().await.unwrap().kind, "connected");
        let msg = sub.receiver.recv().await.unwrap();
        assert_eq!(msg.kind, "file_change");
        assert_eq!(msg.path.as_deref(), Some("/docs/a.txt"));
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn test_drop_unregisters() {
        let notifier = ChangeNotifier::new();
        let sub = notifier.subscribe("s1", "alice", PathFilter::All);
        assert_eq!(notifier.connection_count(), 1);
        drop(sub);
        assert_eq!(notifier.connection_count(), 0);
    }

    #[test]
    fn test_resubscribe_replaces_and_old_drop_keeps_new() {
        let notifier = ChangeNotifier::new();
        let old = notifier.subscribe("s1", "alice", PathFilter::All);
        let _new = notifier.subscribe("s1", "alice", PathFilter::All);
        drop(old);
        assert_eq!(notifier.connection_count(), 1);
    }

    #[test]
    fn test_closed_receiver_is_removed_on_publish() {
        let notifier = ChangeNotifier::new();
        let mut sub = notifier.subscribe("s1", "alice", PathFilter::All);
        sub.receiver.close();
        notifier.publish(&event("/a.txt", "alice"));
        assert_eq!(notifier.connection_count(), 0);
        drop(sub);
    }

    #[test]
    fn test_full_buffer_drops_without_blocking() {
        let notifier = ChangeNotifier::new();
        let _sub = notifier.subscribe("s1", "alice", PathFilter::All);
        for _ in 0..SUBSCRIBER_BUFFER * 2 {
            notifier.publish(&event("/a.txt", "alice"));
        }
        assert_eq!(notifier.connection_count(), 1);
    }
}
