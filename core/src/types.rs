/// Shared types for the messaging layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A direct message as held by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub sender_name: String,
    pub text: String,
    /// Server-assigned ordering key; `None` while the server has not stamped it yet
    pub sent_at: Option<DateTime<Utc>>,
    /// Client clock at submission, informational only
    pub created_at: DateTime<Utc>,
    pub read_by: BTreeSet<String>,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.sent_at.is_none()
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.contains(user_id)
    }

    /// Exactly two distinct participants
    pub fn is_well_formed(&self) -> bool {
        self.sender_id != self.receiver_id
    }

    pub fn pair(&self) -> PairKey {
        PairKey::new(&self.sender_id, &self.receiver_id)
    }

    /// True when this message belongs to the conversation between `a` and `b`
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// The participant that is not `viewer_id`, if `viewer_id` takes part at all
    pub fn peer_of(&self, viewer_id: &str) -> Option<&str> {
        if self.sender_id == viewer_id {
            Some(&self.receiver_id)
        } else if self.receiver_id == viewer_id {
            Some(&self.sender_id)
        } else {
            None
        }
    }
}

/// Draft submitted to the store; the store assigns `id` and `sent_at`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub sender_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub read_by: BTreeSet<String>,
}

impl NewMessage {
    /// Build a draft with the sender pre-marked as reader
    pub fn new(sender: &Viewer, receiver_id: &str, text: &str) -> Self {
        let mut read_by = BTreeSet::new();
        read_by.insert(sender.id.clone());
        Self {
            sender_id: sender.id.clone(),
            receiver_id: receiver_id.to_string(),
            sender_name: sender.name().to_string(),
            text: text.trim().to_string(),
            created_at: Utc::now(),
            read_by,
        }
    }

    pub fn into_message(self, id: String, sent_at: Option<DateTime<Utc>>) -> Message {
        Message {
            id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            sender_name: self.sender_name,
            text: self.text,
            sent_at,
            created_at: self.created_at,
            read_by: self.read_by,
        }
    }
}

/// Kind of change carried by a feed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change from the store's live feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub kind: ChangeKind,
    pub message: Message,
}

impl MessageEvent {
    pub fn added(message: Message) -> Self {
        Self { kind: ChangeKind::Added, message }
    }

    pub fn modified(message: Message) -> Self {
        Self { kind: ChangeKind::Modified, message }
    }

    pub fn removed(message: Message) -> Self {
        Self { kind: ChangeKind::Removed, message }
    }
}

/// Unordered participant pair, stored as (min, max)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey(String, String);

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.0 == user_id || self.1 == user_id
    }

    pub fn other(&self, user_id: &str) -> Option<&str> {
        if self.0 == user_id {
            Some(&self.1)
        } else if self.1 == user_id {
            Some(&self.0)
        } else {
            None
        }
    }

    /// Canonical ID: "dm:{min_id}:{max_id}"
    pub fn conversation_id(&self) -> String {
        format!("dm:{}:{}", self.0, self.1)
    }
}

/// The signed-in identity conversations are computed for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: String,
    pub display_name: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Viewer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            last_seen: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Display name, falling back to the id
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// Summary of one conversation thread (for list views)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Canonical ID: "dm:{min_id}:{max_id}"
    pub conversation_id: String,
    /// The other party's id
    pub peer_id: String,
    /// Preview text of the last message
    pub last_preview: String,
    /// Server timestamp of the last message, `None` while pending
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Messages from the peer the viewer has not read
    pub unread: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_unordered() {
        let ab = PairKey::new("alice", "bob");
        let ba = PairKey::new("bob", "alice");
        assert_eq!(ab, ba);
        assert_eq!(ab.conversation_id(), "dm:alice:bob");
        assert_eq!(ab.other("alice"), Some("bob"));
        assert_eq!(ab.other("carol"), None);
    }

    #[test]
    fn test_draft_trims_and_premarks_sender() {
        let viewer = Viewer::new("alice").with_display_name("Alice");
        let draft = NewMessage::new(&viewer, "bob", "  hi there \n");
        assert_eq!(draft.text, "hi there");
        assert_eq!(draft.sender_name, "Alice");
        assert!(draft.read_by.contains("alice"));
        assert_eq!(draft.read_by.len(), 1);
    }
}
