/// Peer directory: profiles, follow decoration and search
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Public profile of a user as supplied by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub uid: String,
    pub display_name: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub photo_url: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerProfile {
    pub fn new(uid: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: display_name.into(),
            email: None,
            username: None,
            photo_url: None,
            last_seen: None,
        }
    }

    /// Case-insensitive match on display name, email or username
    pub fn matches(&self, term: &str) -> bool {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return true;
        }
        let hit = |field: &str| field.to_lowercase().contains(&term);
        hit(self.display_name.as_str())
            || self.email.as_deref().is_some_and(hit)
            || self.username.as_deref().is_some_and(hit)
    }
}

/// Follow relationships; consulted for decoration only, never to gate messaging
pub trait SocialGraph: Send + Sync {
    fn is_following(&self, viewer_id: &str, target_id: &str) -> bool;
}

/// In-memory follow sets
#[derive(Debug, Default, Clone)]
pub struct FollowGraph {
    following: HashMap<String, HashSet<String>>,
}

impl FollowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn follow(&mut self, viewer_id: &str, target_id: &str) -> bool {
        if viewer_id == target_id {
            return false;
        }
        self.following
            .entry(viewer_id.to_string())
            .or_default()
            .insert(target_id.to_string())
    }

    pub fn unfollow(&mut self, viewer_id: &str, target_id: &str) -> bool {
        self.following
            .get_mut(viewer_id)
            .is_some_and(|set| set.remove(target_id))
    }

}

impl SocialGraph for FollowGraph {
    fn is_following(&self, viewer_id: &str, target_id: &str) -> bool {
        self.following
            .get(viewer_id)
            .is_some_and(|set| set.contains(target_id))
    }
}

/// Profiles other than the viewer matching `term`, most recently seen first
pub fn search<'a>(profiles: &'a [PeerProfile], viewer_id: &str, term: &str) -> Vec<&'a PeerProfile> {
    let mut hits: Vec<&PeerProfile> = profiles
        .iter()
        .filter(|p| p.uid != viewer_id)
        .filter(|p| p.matches(term))
        .collect();
    hits.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
    hits
}

/// Everything a peer list row shows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRow {
    pub profile: PeerProfile,
    pub online: bool,
    pub last_seen_text: String,
    pub following: bool,
    pub last_preview: Option<String>,
    pub unread: usize,
}
