/// In-memory message store: server timestamps, reader-set updates and a live feed
/// Frugal: one map plus a broadcast channel, enough to drive the sync core end to end
use crate::error::{StoreError, StoreResult};
use crate::store::{MessageStore, Subscription};
use crate::types::{Message, MessageEvent, NewMessage};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, unfold, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

const FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    /// id -> (insertion seq, message)
    messages: HashMap<String, (u64, Message)>,
    next_seq: u64,
    defer_timestamps: bool,
    failure: Option<StoreError>,
    rejected_updates: HashSet<String>,
    reader_writes: usize,
}

impl Inner {
    fn check(&self) -> StoreResult<()> {
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Current collection in feed order: resolved by server time, pending last
    fn snapshot(&self) -> Vec<Message> {
        let mut all: Vec<&(u64, Message)> = self.messages.values().collect();
        all.sort_by_key(|(seq, m)| (m.sent_at.is_none(), m.sent_at, *seq));
        all.into_iter().map(|(_, m)| m.clone()).collect()
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    feed: broadcast::Sender<StoreResult<MessageEvent>>,
}

impl MemoryStore {
    /// Store that stamps server time on create
    pub fn new() -> Self {
        Self::build(Inner::default())
    }

    /// Store that leaves new messages pending until [`MemoryStore::resolve_pending`]
    pub fn with_deferred_timestamps() -> Self {
        Self::build(Inner {
            defer_timestamps: true,
            ..Default::default()
        })
    }

    fn build(inner: Inner) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(inner)),
            feed,
        }
    }

    fn publish(&self, event: MessageEvent) {
        // No subscribers is fine
        let _ = self.feed.send(Ok(event));
    }

    /// Stamp server time on every pending message and emit `modified` for each
    pub async fn resolve_pending(&self) -> usize {
        let mut inner = self.inner.write().await;
        let mut pending: Vec<(u64, String)> = inner
            .messages
            .values()
            .filter(|(_, m)| m.is_pending())
            .map(|(seq, m)| (*seq, m.id.clone()))
            .collect();
        pending.sort();

        for (_, id) in &pending {
            if let Some((_, message)) = inner.messages.get_mut(id) {
                message.sent_at = Some(Utc::now());
                let event = MessageEvent::modified(message.clone());
                self.publish(event);
            }
        }
        pending.len()
    }

    /// Insert a fully formed message as if another client had written it
    pub async fn insert(&self, message: Message) {
        let mut inner = self.inner.write().await;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.messages.insert(message.id.clone(), (seq, message.clone()));
        self.publish(MessageEvent::added(message));
    }

    /// Emit `added` again for a stored message (at-least-once delivery)
    pub async fn redeliver(&self, id: &str) -> bool {
        let inner = self.inner.read().await;
        match inner.messages.get(id) {
            Some((_, message)) => {
                self.publish(MessageEvent::added(message.clone()));
                true
            }
            None => false,
        }
    }

    /// Delete a message and emit `removed`
    pub async fn remove(&self, id: &str) -> Option<Message> {
        let mut inner = self.inner.write().await;
        let (_, message) = inner.messages.remove(id)?;
        self.publish(MessageEvent::removed(message.clone()));
        Some(message)
    }

    /// Break every open feed; subscribers see an error item
    pub fn break_feeds(&self) {
        warn!("Breaking {} open feed(s)", self.feed.receiver_count());
        let _ = self
            .feed
            .send(Err(StoreError::Unavailable("feed dropped".to_string())));
    }

    /// Make every call fail with `failure` until cleared with `None`
    pub async fn set_failure(&self, failure: Option<StoreError>) {
        self.inner.write().await.failure = failure;
    }

    /// Make `add_reader` fail for one message
    pub async fn reject_updates_to(&self, id: &str) {
        self.inner.write().await.rejected_updates.insert(id.to_string());
    }

    pub async fn accept_updates_to(&self, id: &str) {
        self.inner.write().await.rejected_updates.remove(id);
    }

    pub async fn get(&self, id: &str) -> Option<Message> {
        self.inner.read().await.messages.get(id).map(|(_, m)| m.clone())
    }

    /// Number of `add_reader` calls that reached storage
    pub async fn reader_writes(&self) -> usize {
        self.inner.read().await.reader_writes
    }

    /// Number of open feeds
    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }

    /// Get message count
    pub async fn count(&self) -> usize {
        self.inner.read().await.messages.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, draft: NewMessage) -> StoreResult<String> {
        let mut inner = self.inner.write().await;
        inner.check()?;

        let id = Uuid::new_v4().to_string();
        let sent_at = if inner.defer_timestamps {
            None
        } else {
            Some(Utc::now())
        };
        let message = draft.into_message(id.clone(), sent_at);

        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.messages.insert(id.clone(), (seq, message.clone()));
        debug!("Stored message {} from {} to {}", id, message.sender_id, message.receiver_id);
        self.publish(MessageEvent::added(message));
        Ok(id)
    }

    async fn find_addressed(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        inner.check()?;
        Ok(inner
            .snapshot()
            .into_iter()
            .filter(|m| m.sender_id == sender_id && m.receiver_id == receiver_id)
            .collect())
    }

    async fn add_reader(&self, message_id: &str, reader_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.check()?;
        if inner.rejected_updates.contains(message_id) {
            return Err(StoreError::PermissionDenied(format!(
                "update of {} rejected",
                message_id
            )));
        }

        inner.reader_writes += 1;
        let (_, message) = inner
            .messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        if message.read_by.insert(reader_id.to_string()) {
            let event = MessageEvent::modified(message.clone());
            self.publish(event);
        }
        Ok(())
    }

    async fn subscribe_all(&self) -> StoreResult<Subscription> {
        // Holding the lock while subscribing keeps replay and live feed gap-free
        let inner = self.inner.read().await;
        inner.check()?;
        let rx = self.feed.subscribe();
        let replay: Vec<StoreResult<MessageEvent>> = inner
            .snapshot()
            .into_iter()
            .map(|m| Ok(MessageEvent::added(m)))
            .collect();
        drop(inner);

        let live = unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            match rx.recv().await {
                Ok(item) => {
                    let broken = item.is_err();
                    Some((item, if broken { None } else { Some(rx) }))
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Feed subscriber lagged {} events", n);
                    Some((Err(RecvError::Lagged(n).into()), None))
                }
                Err(RecvError::Closed) => None,
            }
        });

        Ok(stream::iter(replay).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Viewer;

    #[tokio::test]
    async fn test_create_stamps_and_replays_in_order() {
        let store = MemoryStore::new();
        let alice = Viewer::new("alice");
        let first = store.create(NewMessage::new(&alice, "bob", "one")).await.unwrap();
        let second = store.create(NewMessage::new(&alice, "bob", "two")).await.unwrap();

        let mut sub = store.subscribe_all().await.unwrap();
        let a = sub.next().await.unwrap().unwrap();
        let b = sub.next().await.unwrap().unwrap();
        assert_eq!(a.message.id, first);
        assert_eq!(b.message.id, second);
        assert!(a.message.sent_at.is_some());
        assert_eq!(store.count().await, 2);
    }

    #[tokio::test]
    async fn test_add_reader_is_set_union() {
        let store = MemoryStore::new();
        let bob = Viewer::new("bob");
        let id = store.create(NewMessage::new(&bob, "alice", "hey")).await.unwrap();

        store.add_reader(&id, "alice").await.unwrap();
        store.add_reader(&id, "alice").await.unwrap();
        let message = store.get(&id).await.unwrap();
        assert_eq!(message.read_by.len(), 2);
        assert_eq!(store.reader_writes().await, 2);

        assert!(matches!(
            store.add_reader("missing", "alice").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_broken_feed_ends_with_error() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe_all().await.unwrap();
        store.break_feeds();
        assert!(sub.next().await.unwrap().is_err());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_conversation_feed_filters_pairs() {
        let store = MemoryStore::new();
        let alice = Viewer::new("alice");
        store.create(NewMessage::new(&alice, "carol", "not here")).await.unwrap();
        let wanted = store.create(NewMessage::new(&alice, "bob", "here")).await.unwrap();

        let mut sub = store.subscribe_conversation("bob", "alice").await.unwrap();
        let event = sub.next().await.unwrap().unwrap();
        assert_eq!(event.message.id, wanted);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        store
            .set_failure(Some(StoreError::Unavailable("offline".into())))
            .await;
        let alice = Viewer::new("alice");
        assert!(store.create(NewMessage::new(&alice, "bob", "hi")).await.is_err());
        assert!(store.subscribe_all().await.is_err());

        store.set_failure(None).await;
        assert!(store.create(NewMessage::new(&alice, "bob", "hi")).await.is_ok());
    }
}
