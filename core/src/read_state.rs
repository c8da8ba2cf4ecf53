/// Read-state mutation against the store, scoped to one sender
use crate::error::{Result, StoreError, ValidationError};
use crate::store::MessageStore;
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one mark-as-read sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadSweep {
    /// Messages that gained the viewer as reader
    pub marked: usize,
    /// Messages that were already read and left untouched
    pub skipped: usize,
    /// Writes the store refused; they stay unread and the next sweep retries them
    pub failed: Vec<(String, StoreError)>,
}

impl ReadSweep {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_noop(&self) -> bool {
        self.marked == 0 && self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct ReadStateMutator {
    store: Arc<dyn MessageStore>,
}

impl ReadStateMutator {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Add `viewer_id` to the readers of every message `sender_id` sent it.
    ///
    /// Only messages still missing the viewer are written, so repeating the
    /// call without new messages performs no store writes.
    pub async fn mark_conversation_read(&self, viewer_id: &str, sender_id: &str) -> Result<ReadSweep> {
        if viewer_id.is_empty() {
            return Err(ValidationError::NoViewer.into());
        }
        if sender_id.is_empty() {
            return Err(ValidationError::MissingReceiver.into());
        }

        let addressed = self.store.find_addressed(sender_id, viewer_id).await?;
        let (unread, read): (Vec<_>, Vec<_>) = addressed
            .into_iter()
            .partition(|m| !m.is_read_by(viewer_id));

        let mut sweep = ReadSweep {
            skipped: read.len(),
            ..Default::default()
        };
        if unread.is_empty() {
            debug!("Nothing unread from {} for {}", sender_id, viewer_id);
            return Ok(sweep);
        }

        let writes = unread
            .iter()
            .map(|m| self.store.add_reader(&m.id, viewer_id));
        let results = join_all(writes).await;

        for (message, result) in unread.iter().zip(results) {
            match result {
                Ok(()) => sweep.marked += 1,
                Err(e) => {
                    warn!("Failed to mark {} read for {}: {}", message.id, viewer_id, e);
                    sweep.failed.push((message.id.clone(), e));
                }
            }
        }

        debug!(
            "Marked {} message(s) from {} read for {} ({} failed)",
            sweep.marked,
            sender_id,
            viewer_id,
            sweep.failed.len()
        );
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_store::MemoryStore;
    use crate::types::{NewMessage, Viewer};

    async fn seeded() -> (MemoryStore, Vec<String>) {
        let store = MemoryStore::new();
        let bob = Viewer::new("bob");
        let alice = Viewer::new("alice");
        let mut ids = Vec::new();
        for text in ["one", "two"] {
            ids.push(store.create(NewMessage::new(&bob, "alice", text)).await.unwrap());
        }
        store.create(NewMessage::new(&alice, "bob", "reply")).await.unwrap();
        (store, ids)
    }

    #[tokio::test]
    async fn test_sweep_marks_only_inbound_from_sender() {
        let (store, ids) = seeded().await;
        let mutator = ReadStateMutator::new(Arc::new(store.clone()));

        let sweep = mutator.mark_conversation_read("alice", "bob").await.unwrap();
        assert_eq!(sweep.marked, 2);
        assert!(sweep.is_complete());
        for id in &ids {
            assert!(store.get(id).await.unwrap().is_read_by("alice"));
        }
    }

    #[tokio::test]
    async fn test_repeat_sweep_writes_nothing() {
        let (store, _) = seeded().await;
        let mutator = ReadStateMutator::new(Arc::new(store.clone()));

        mutator.mark_conversation_read("alice", "bob").await.unwrap();
        let writes = store.reader_writes().await;

        let again = mutator.mark_conversation_read("alice", "bob").await.unwrap();
        assert!(again.is_noop());
        assert_eq!(again.skipped, 2);
        assert_eq!(store.reader_writes().await, writes);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_by_next_sweep() {
        let (store, ids) = seeded().await;
        store.reject_updates_to(&ids[1]).await;
        let mutator = ReadStateMutator::new(Arc::new(store.clone()));

        let first = mutator.mark_conversation_read("alice", "bob").await.unwrap();
        assert_eq!(first.marked, 1);
        assert_eq!(first.failed.len(), 1);
        assert_eq!(first.failed[0].0, ids[1]);

        store.accept_updates_to(&ids[1]).await;
        let second = mutator.mark_conversation_read("alice", "bob").await.unwrap();
        assert_eq!(second.marked, 1);
        assert_eq!(second.skipped, 1);
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_as_error() {
        let (store, _) = seeded().await;
        store
            .set_failure(Some(StoreError::Unavailable("offline".into())))
            .await;
        let mutator = ReadStateMutator::new(Arc::new(store));

        let err = mutator.mark_conversation_read("alice", "bob").await.unwrap_err();
        assert!(err.is_transient());
    }
}
