/// dmsync - Direct message synchronization core
///
/// Derives ordered conversations, last-message previews, unread counts and
/// presence for a viewer from a store's live message feed, and applies
/// idempotent read-state updates back to the store.

pub mod aggregate;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod index;
pub mod message_store;
pub mod presence;
pub mod read_state;
pub mod store;
pub mod sync;
pub mod types;

pub use config::SyncConfig;
pub use error::{Result, StoreError, SyncError, ValidationError};
pub use events::SyncEvent;
pub use message_store::MemoryStore;
pub use store::MessageStore;
pub use sync::ConversationSync;
pub use types::{Message, MessageEvent, NewMessage, Viewer};
