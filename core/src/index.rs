/// Conversation index: every known message keyed by id, plus an ordered view per participant pair
use crate::types::{ChangeKind, Message, MessageEvent, PairKey};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{trace, warn};

/// Sort key inside one conversation: resolved before pending, then server time, then arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    pending: bool,
    sent_at: Option<DateTime<Utc>>,
    arrival: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    arrival: u64,
}

impl Entry {
    fn key(&self) -> OrderKey {
        OrderKey {
            pending: self.message.is_pending(),
            sent_at: self.message.sent_at,
            arrival: self.arrival,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConversationIndex {
    messages: HashMap<String, Entry>,
    by_pair: HashMap<PairKey, BTreeMap<OrderKey, String>>,
    next_arrival: u64,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one feed event. Returns the pair whose conversation changed, if any.
    pub fn apply(&mut self, event: &MessageEvent) -> Option<PairKey> {
        match event.kind {
            ChangeKind::Added | ChangeKind::Modified => self.upsert(event.message.clone()),
            ChangeKind::Removed => self.remove(&event.message.id),
        }
    }

    /// Insert or replace by id (last write wins). Arrival order is kept from the first sighting.
    pub fn upsert(&mut self, message: Message) -> Option<PairKey> {
        if !message.is_well_formed() {
            warn!(
                "Ignoring message {} addressed from {} to itself",
                message.id, message.sender_id
            );
            return None;
        }

        let arrival = match self.messages.get(&message.id) {
            Some(existing) if existing.message == message => {
                trace!("Duplicate delivery of {}", message.id);
                return None;
            }
            Some(existing) => {
                let arrival = existing.arrival;
                self.unlink(&message.id);
                arrival
            }
            None => {
                self.next_arrival += 1;
                self.next_arrival
            }
        };

        let pair = message.pair();
        let id = message.id.clone();
        let entry = Entry { message, arrival };
        self.by_pair
            .entry(pair.clone())
            .or_default()
            .insert(entry.key(), id.clone());
        self.messages.insert(id, entry);
        Some(pair)
    }

    /// Drop a message by id
    pub fn remove(&mut self, id: &str) -> Option<PairKey> {
        self.unlink(id).map(|entry| entry.message.pair())
    }

    fn unlink(&mut self, id: &str) -> Option<Entry> {
        let entry = self.messages.remove(id)?;
        let pair = entry.message.pair();
        if let Some(ordered) = self.by_pair.get_mut(&pair) {
            ordered.remove(&entry.key());
            if ordered.is_empty() {
                self.by_pair.remove(&pair);
            }
        }
        Some(entry)
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.messages.clear();
        self.by_pair.clear();
    }

    /// Ordered messages between `a` and `b`
    pub fn conversation<'a>(
        &'a self,
        a: &str,
        b: &str,
    ) -> impl DoubleEndedIterator<Item = &'a Message> + 'a {
        let key = PairKey::new(a, b);
        self.by_pair
            .get(&key)
            .into_iter()
            .flat_map(|ordered| ordered.values())
            .filter_map(move |id| self.messages.get(id).map(|e| &e.message))
    }

    /// Owned copy of the conversation between `viewer_id` and `peer_id`
    pub fn partition(&self, viewer_id: &str, peer_id: &str) -> Vec<Message> {
        self.conversation(viewer_id, peer_id).cloned().collect()
    }

    /// Every peer `viewer_id` has at least one message with
    pub fn peers_of<'a>(&'a self, viewer_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.by_pair.keys().filter_map(move |pair| pair.other(viewer_id))
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Partition an arbitrary message set from scratch.
///
/// Iteration order stands in for arrival order; a repeated id keeps its first
/// position and the fields of its last occurrence.
pub fn partition<'a, I>(messages: I, viewer_id: &str, peer_id: &str) -> Vec<Message>
where
    I: IntoIterator<Item = &'a Message>,
{
    let mut index = ConversationIndex::new();
    for message in messages {
        if message.is_between(viewer_id, peer_id) {
            index.upsert(message.clone());
        }
    }
    index.partition(viewer_id, peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    fn msg(id: &str, from: &str, to: &str, sent_at: Option<DateTime<Utc>>) -> Message {
        Message {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            sender_name: from.to_string(),
            text: format!("text {}", id),
            sent_at,
            created_at: Utc::now(),
            read_by: BTreeSet::from([from.to_string()]),
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_messages_land_only_in_their_pair() {
        let mut index = ConversationIndex::new();
        index.upsert(msg("1", "alice", "bob", at(1)));
        index.upsert(msg("2", "bob", "alice", at(2)));
        index.upsert(msg("3", "alice", "carol", at(3)));
        index.upsert(msg("4", "carol", "bob", at(4)));

        assert_eq!(ids(&index.partition("alice", "bob")), vec!["1", "2"]);
        assert_eq!(ids(&index.partition("bob", "alice")), vec!["1", "2"]);
        assert_eq!(ids(&index.partition("alice", "carol")), vec!["3"]);
        assert_eq!(ids(&index.partition("bob", "carol")), vec!["4"]);
        assert!(index.partition("alice", "dave").is_empty());

        let mut peers: Vec<&str> = index.peers_of("alice").collect();
        peers.sort();
        assert_eq!(peers, vec!["bob", "carol"]);
    }

    #[test]
    fn test_orders_by_server_time_not_arrival() {
        let mut index = ConversationIndex::new();
        index.upsert(msg("late", "alice", "bob", at(30)));
        index.upsert(msg("early", "bob", "alice", at(10)));
        index.upsert(msg("mid", "alice", "bob", at(20)));

        assert_eq!(ids(&index.partition("alice", "bob")), vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_ties_break_by_arrival_and_pending_sorts_last() {
        let mut index = ConversationIndex::new();
        index.upsert(msg("p1", "alice", "bob", None));
        index.upsert(msg("b", "alice", "bob", at(5)));
        index.upsert(msg("a", "bob", "alice", at(5)));
        index.upsert(msg("p2", "bob", "alice", None));
        index.upsert(msg("first", "bob", "alice", at(1)));

        assert_eq!(
            ids(&index.partition("alice", "bob")),
            vec!["first", "b", "a", "p1", "p2"]
        );
    }

    #[test]
    fn test_resolving_pending_timestamp_moves_message_into_place() {
        let mut index = ConversationIndex::new();
        index.upsert(msg("pending", "alice", "bob", None));
        index.upsert(msg("later", "bob", "alice", at(50)));
        assert_eq!(ids(&index.partition("alice", "bob")), vec!["later", "pending"]);

        let event = MessageEvent::modified(msg("pending", "alice", "bob", at(40)));
        assert!(index.apply(&event).is_some());
        assert_eq!(ids(&index.partition("alice", "bob")), vec!["pending", "later"]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_duplicate_id_keeps_one_entry_with_latest_fields() {
        let mut index = ConversationIndex::new();
        let original = msg("dup", "bob", "alice", at(1));
        let mut updated = original.clone();
        updated.read_by.insert("alice".to_string());

        index.apply(&MessageEvent::added(original.clone()));
        assert!(index.apply(&MessageEvent::added(original)).is_none());
        index.apply(&MessageEvent::added(updated));

        let conv = index.partition("alice", "bob");
        assert_eq!(conv.len(), 1);
        assert!(conv[0].is_read_by("alice"));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut index = ConversationIndex::new();
        let gone = msg("1", "alice", "bob", at(1));
        index.upsert(gone.clone());
        index.upsert(msg("2", "alice", "bob", at(2)));
        index.upsert(msg("3", "alice", "carol", at(3)));

        assert_eq!(
            index.apply(&MessageEvent::removed(gone)),
            Some(PairKey::new("alice", "bob"))
        );
        assert_eq!(ids(&index.partition("alice", "bob")), vec!["2"]);
        assert!(index.remove("missing").is_none());

        assert_eq!(index.len(), 2);

        index.clear();
        assert!(index.is_empty());
    }

    #[test]
    fn test_self_addressed_message_is_ignored() {
        let mut index = ConversationIndex::new();
        assert!(index.upsert(msg("x", "alice", "alice", at(1))).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_free_partition_matches_index() {
        let all = vec![
            msg("3", "alice", "bob", at(3)),
            msg("1", "bob", "alice", at(1)),
            msg("x", "carol", "alice", at(2)),
            msg("p", "alice", "bob", None),
            msg("2", "alice", "bob", at(2)),
            msg("1", "bob", "alice", at(1)),
        ];

        let mut index = ConversationIndex::new();
        for m in &all {
            index.upsert(m.clone());
        }

        let from_scratch = partition(&all, "alice", "bob");
        assert_eq!(ids(&from_scratch), vec!["1", "2", "3", "p"]);
        assert_eq!(from_scratch, index.partition("alice", "bob"));
    }
}
