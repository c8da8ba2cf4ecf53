/// Previews and unread counts derived from the conversation index
use crate::index::ConversationIndex;
use crate::types::{ConversationSummary, Message, PairKey};

/// Temporally last message between the viewer and `peer_id`
pub fn last_message_for<'a>(
    index: &'a ConversationIndex,
    viewer_id: &str,
    peer_id: &str,
) -> Option<&'a Message> {
    index.conversation(viewer_id, peer_id).next_back()
}

/// Messages from `peer_id` to the viewer that the viewer has not acknowledged
pub fn unread_count_for(index: &ConversationIndex, viewer_id: &str, peer_id: &str) -> usize {
    index
        .conversation(viewer_id, peer_id)
        .filter(|m| m.sender_id == peer_id && m.receiver_id == viewer_id)
        .filter(|m| !m.is_read_by(viewer_id))
        .count()
}

/// Total unread across every peer
pub fn total_unread(index: &ConversationIndex, viewer_id: &str) -> usize {
    index
        .peers_of(viewer_id)
        .map(|peer| unread_count_for(index, viewer_id, peer))
        .sum()
}

/// One summary per peer, most recent conversation first (pending counts as newest)
pub fn conversation_summaries(
    index: &ConversationIndex,
    viewer_id: &str,
) -> Vec<ConversationSummary> {
    let mut rows: Vec<(&Message, ConversationSummary)> = index
        .peers_of(viewer_id)
        .filter_map(|peer| {
            let last = last_message_for(index, viewer_id, peer)?;
            let summary = ConversationSummary {
                conversation_id: PairKey::new(viewer_id, peer).conversation_id(),
                peer_id: peer.to_string(),
                last_preview: last.text.clone(),
                last_timestamp: last.sent_at,
                unread: unread_count_for(index, viewer_id, peer),
            };
            Some((last, summary))
        })
        .collect();

    rows.sort_by(|(a, _), (b, _)| {
        b.is_pending()
            .cmp(&a.is_pending())
            .then_with(|| b.sent_at.cmp(&a.sent_at))
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    rows.into_iter().map(|(_, summary)| summary).collect()
}
