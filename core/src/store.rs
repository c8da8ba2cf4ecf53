/// Contract of the external message store and its live feed
use crate::error::{StoreError, StoreResult};
use crate::types::{Message, MessageEvent, NewMessage, PairKey};
use async_trait::async_trait;
use futures_util::future::ready;
use futures_util::stream::{BoxStream, StreamExt};

/// Live feed of store changes. An `Err` item means the feed broke and must be re-established.
pub type Subscription = BoxStream<'static, StoreResult<MessageEvent>>;

/// Message store consumed by the sync core.
///
/// Implementations must:
/// - assign `id` and the server timestamp on `create`
/// - treat `add_reader` as a set union on `read_by`
/// - open every subscription by replaying the current collection as `added`
///   events ordered by server time, then stream later changes
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a new message, returning its store id
    async fn create(&self, draft: NewMessage) -> StoreResult<String>;

    /// Every message sent by `sender_id` to `receiver_id`
    async fn find_addressed(&self, sender_id: &str, receiver_id: &str)
        -> StoreResult<Vec<Message>>;

    /// Add `reader_id` to the reader set of one message
    async fn add_reader(&self, message_id: &str, reader_id: &str) -> StoreResult<()>;

    /// Feed of the whole collection
    async fn subscribe_all(&self) -> StoreResult<Subscription>;

    /// Feed narrowed to one conversation
    async fn subscribe_conversation(&self, a: &str, b: &str) -> StoreResult<Subscription> {
        let pair = PairKey::new(a, b);
        let all = self.subscribe_all().await?;
        Ok(all
            .filter(move |item| {
                ready(match item {
                    Ok(event) => event.message.pair() == pair,
                    Err(_) => true,
                })
            })
            .boxed())
    }
}

impl From<tokio::sync::broadcast::error::RecvError> for StoreError {
    fn from(e: tokio::sync::broadcast::error::RecvError) -> Self {
        StoreError::Unavailable(format!("feed interrupted: {}", e))
    }
}
