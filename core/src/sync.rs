/// Conversation synchronization core
///
/// Owns the message index, keeps it fed from the store's live feeds and exposes
/// every derived view (conversation, previews, unread counts, presence rows).
use crate::aggregate;
use crate::config::SyncConfig;
use crate::directory::{self, PeerProfile, PeerRow, SocialGraph};
use crate::error::{Result, ValidationError};
use crate::events::{EventEmitter, SyncEvent};
use crate::index::ConversationIndex;
use crate::presence::{last_seen_text, PresenceEstimator};
use crate::read_state::{ReadStateMutator, ReadSweep};
use crate::store::MessageStore;
use crate::types::{ConversationSummary, Message, MessageEvent, NewMessage, PairKey, Viewer};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    All,
    Conversation,
}

/// Identifies the feed an event came from; events from a torn-down feed are refused
#[derive(Debug, Clone, Copy)]
struct FeedToken {
    feed: Feed,
    epoch: u64,
}

/// Viewer, active peer and the index every view derives from
#[derive(Debug, Default)]
pub struct SyncState {
    viewer: Option<Viewer>,
    active_peer: Option<String>,
    index: ConversationIndex,
    /// The conversation feed broke; the active conversation shows nothing until it returns
    conversation_stale: bool,
    viewer_epoch: u64,
    peer_epoch: u64,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn viewer(&self) -> Option<&Viewer> {
        self.viewer.as_ref()
    }

    pub fn active_peer(&self) -> Option<&str> {
        self.active_peer.as_deref()
    }

    pub fn index(&self) -> &ConversationIndex {
        &self.index
    }

    /// Switch viewer and forget everything derived for the previous one
    pub fn set_viewer(&mut self, viewer: Option<Viewer>) {
        self.viewer = viewer;
        self.active_peer = None;
        self.conversation_stale = false;
        self.index.clear();
        self.viewer_epoch += 1;
        self.peer_epoch += 1;
    }

    pub fn select_peer(&mut self, peer_id: Option<String>) {
        self.active_peer = peer_id;
        self.conversation_stale = false;
        self.peer_epoch += 1;
    }

    pub fn is_conversation_stale(&self) -> bool {
        self.conversation_stale
    }

    fn token(&self, feed: Feed) -> FeedToken {
        let epoch = match feed {
            Feed::All => self.viewer_epoch,
            Feed::Conversation => self.peer_epoch,
        };
        FeedToken { feed, epoch }
    }

    fn accepts(&self, token: FeedToken) -> bool {
        self.token(token.feed).epoch == token.epoch
    }

    /// Apply one feed event. Returns the peer whose conversation with the viewer changed.
    /// Messages the viewer takes no part in are not kept.
    pub fn apply(&mut self, event: &MessageEvent) -> Option<String> {
        let viewer_id = self.viewer.as_ref()?.id.as_str();
        let peer = event.message.peer_of(viewer_id)?.to_string();
        self.index.apply(event).map(|_| peer)
    }

    pub fn active_conversation(&self) -> Vec<Message> {
        if self.conversation_stale {
            return Vec::new();
        }
        match (&self.viewer, &self.active_peer) {
            (Some(viewer), Some(peer)) => self.index.partition(&viewer.id, peer),
            _ => Vec::new(),
        }
    }

    pub fn last_message_for(&self, peer_id: &str) -> Option<&Message> {
        let viewer = self.viewer.as_ref()?;
        aggregate::last_message_for(&self.index, &viewer.id, peer_id)
    }

    pub fn unread_count_for(&self, peer_id: &str) -> usize {
        self.viewer
            .as_ref()
            .map(|v| aggregate::unread_count_for(&self.index, &v.id, peer_id))
            .unwrap_or(0)
    }

    pub fn total_unread(&self) -> usize {
        self.viewer
            .as_ref()
            .map(|v| aggregate::total_unread(&self.index, &v.id))
            .unwrap_or(0)
    }

    pub fn conversation_summaries(&self) -> Vec<ConversationSummary> {
        self.viewer
            .as_ref()
            .map(|v| aggregate::conversation_summaries(&self.index, &v.id))
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct Feeds {
    all: Option<JoinHandle<()>>,
    conversation: Option<JoinHandle<()>>,
}

impl Feeds {
    fn abort_conversation(&mut self) {
        if let Some(handle) = self.conversation.take() {
            handle.abort();
        }
    }

    fn abort_all(&mut self) {
        if let Some(handle) = self.all.take() {
            handle.abort();
        }
        self.abort_conversation();
    }
}

impl Drop for Feeds {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Public handle of the synchronization core
#[derive(Clone)]
pub struct ConversationSync {
    store: Arc<dyn MessageStore>,
    config: SyncConfig,
    state: Arc<RwLock<SyncState>>,
    feeds: Arc<Mutex<Feeds>>,
    reads: ReadStateMutator,
    presence: PresenceEstimator,
    events: EventEmitter,
}

impl ConversationSync {
    pub fn new(store: Arc<dyn MessageStore>, config: SyncConfig) -> Self {
        Self {
            reads: ReadStateMutator::new(store.clone()),
            presence: PresenceEstimator::new(config.freshness_window),
            events: EventEmitter::new(config.event_capacity),
            store,
            config,
            state: Arc::new(RwLock::new(SyncState::new())),
            feeds: Arc::new(Mutex::new(Feeds::default())),
        }
    }

    /// Sign a viewer in (or out with `None`). All feeds are torn down and all views emptied first.
    pub async fn set_viewer(&self, viewer: Option<Viewer>) {
        let mut feeds = self.feeds.lock().await;
        feeds.abort_all();

        let token = {
            let mut state = self.state.write().await;
            state.set_viewer(viewer.clone());
            state.token(Feed::All)
        };
        self.events.emit(SyncEvent::ViewReset);

        match viewer {
            Some(viewer) => {
                info!("Viewer {} signed in, subscribing to messages", viewer.id);
                feeds.all = Some(self.spawn_feed(token, None));
            }
            None => info!("Viewer signed out"),
        }
    }

    pub async fn viewer(&self) -> Option<Viewer> {
        self.state.read().await.viewer().cloned()
    }

    /// Set or clear the active conversation target
    pub async fn select_peer(&self, peer_id: Option<String>) {
        let mut feeds = self.feeds.lock().await;
        feeds.abort_conversation();

        let (token, viewer_id) = {
            let mut state = self.state.write().await;
            state.select_peer(peer_id.clone());
            (state.token(Feed::Conversation), state.viewer().map(|v| v.id.clone()))
        };
        self.events.emit(SyncEvent::PeerSelected {
            peer_id: peer_id.clone(),
        });

        if let (Some(viewer_id), Some(peer_id)) = (viewer_id, peer_id) {
            if viewer_id != peer_id {
                debug!("Watching conversation {} <-> {}", viewer_id, peer_id);
                feeds.conversation = Some(self.spawn_feed(token, Some((viewer_id, peer_id))));
            }
        }
    }

    pub async fn active_peer(&self) -> Option<String> {
        self.state.read().await.active_peer().map(str::to_string)
    }

    /// Validate and submit a message from the viewer; returns the store id
    pub async fn send_message(&self, text: &str, receiver_id: &str) -> Result<String> {
        let viewer = self.state.read().await.viewer().cloned();
        let draft = match validate_send(viewer.as_ref(), text, receiver_id) {
            Ok(draft) => draft,
            Err(e) => {
                debug!("Send rejected: {}", e);
                return Err(e.into());
            }
        };

        match self.store.create(draft).await {
            Ok(id) => {
                debug!("Sent message {} to {}", id, receiver_id);
                Ok(id)
            }
            Err(e) => {
                error!("Error sending message to {}: {}", receiver_id, e);
                Err(e.into())
            }
        }
    }

    /// Ordered messages with the active peer; empty when none is selected
    pub async fn active_conversation(&self) -> Vec<Message> {
        self.state.read().await.active_conversation()
    }

    pub async fn last_message_for(&self, peer_id: &str) -> Option<Message> {
        self.state.read().await.last_message_for(peer_id).cloned()
    }

    pub async fn unread_count_for(&self, peer_id: &str) -> usize {
        self.state.read().await.unread_count_for(peer_id)
    }

    pub async fn total_unread(&self) -> usize {
        self.state.read().await.total_unread()
    }

    pub async fn conversation_summaries(&self) -> Vec<ConversationSummary> {
        self.state.read().await.conversation_summaries()
    }

    /// Mark everything `peer_id` sent the viewer as read. The local view follows
    /// once the store echoes the updates back through the feed.
    pub async fn mark_read(&self, peer_id: &str) -> Result<ReadSweep> {
        let viewer_id = match self.state.read().await.viewer() {
            Some(viewer) => viewer.id.clone(),
            None => return Err(ValidationError::NoViewer.into()),
        };

        self.reads
            .mark_conversation_read(&viewer_id, peer_id)
            .await
            .inspect_err(|e| error!("Error marking messages from {} read: {}", peer_id, e))
    }

    /// Presence from a last-liveness timestamp, against the wall clock now
    pub fn is_online(&self, last_seen: Option<DateTime<Utc>>) -> bool {
        self.presence.is_online(last_seen)
    }

    /// One decorated row per peer matching `term`, most recently seen first
    pub async fn peer_rows(
        &self,
        profiles: &[PeerProfile],
        graph: &dyn SocialGraph,
        term: &str,
    ) -> Vec<PeerRow> {
        let state = self.state.read().await;
        let Some(viewer) = state.viewer() else {
            return Vec::new();
        };
        let now = Utc::now();

        directory::search(profiles, &viewer.id, term)
            .into_iter()
            .map(|profile| PeerRow {
                online: self.presence.is_online_at(profile.last_seen, now),
                last_seen_text: last_seen_text(profile.last_seen, now),
                following: graph.is_following(&viewer.id, &profile.uid),
                last_preview: state.last_message_for(&profile.uid).map(|m| m.text.clone()),
                unread: state.unread_count_for(&profile.uid),
                profile: profile.clone(),
            })
            .collect()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Tear down every feed and forget the viewer
    pub async fn shutdown(&self) {
        self.set_viewer(None).await;
        info!("Synchronization core stopped");
    }

    fn spawn_feed(&self, token: FeedToken, pair: Option<(String, String)>) -> JoinHandle<()> {
        let store = self.store.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        tokio::spawn(async move { run_feed(store, state, events, config, token, pair).await })
    }
}

fn validate_send(
    viewer: Option<&Viewer>,
    text: &str,
    receiver_id: &str,
) -> std::result::Result<NewMessage, ValidationError> {
    let viewer = viewer.ok_or(ValidationError::NoViewer)?;
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyText);
    }
    if receiver_id.trim().is_empty() {
        return Err(ValidationError::MissingReceiver);
    }
    if receiver_id == viewer.id {
        return Err(ValidationError::SelfAddressed);
    }
    Ok(NewMessage::new(viewer, receiver_id, text))
}

/// Pump one feed into the state until aborted, resubscribing with backoff when it breaks
async fn run_feed(
    store: Arc<dyn MessageStore>,
    state: Arc<RwLock<SyncState>>,
    events: EventEmitter,
    config: SyncConfig,
    token: FeedToken,
    pair: Option<(String, String)>,
) {
    let label = match &pair {
        Some((a, b)) => PairKey::new(a, b).conversation_id(),
        None => "all".to_string(),
    };
    let mut delay = config.resubscribe_delay;
    let mut attempts: u32 = 0;

    loop {
        let opened = match &pair {
            Some((a, b)) => store.subscribe_conversation(a, b).await,
            None => store.subscribe_all().await,
        };

        match opened {
            Ok(mut feed) => {
                let opened_at = Instant::now();
                if attempts > 0 {
                    {
                        let mut state = state.write().await;
                        if !state.accepts(token) {
                            return;
                        }
                        if pair.is_some() {
                            state.conversation_stale = false;
                        }
                    }
                    info!("Feed {} re-established after {} attempt(s)", label, attempts);
                    events.emit(SyncEvent::Resubscribed {
                        conversation: pair.is_some(),
                    });
                }

                while let Some(item) = feed.next().await {
                    match item {
                        Ok(event) => {
                            let changed = {
                                let mut state = state.write().await;
                                if !state.accepts(token) {
                                    return;
                                }
                                state.apply(&event)
                            };
                            if let Some(peer_id) = changed {
                                events.emit(SyncEvent::ConversationChanged { peer_id });
                            }
                        }
                        Err(e) => {
                            warn!("Feed {} failed: {}", label, e);
                            break;
                        }
                    }
                }

                // A feed that drops right after its replay keeps backing off
                if opened_at.elapsed() >= config.max_resubscribe_delay {
                    attempts = 0;
                    delay = config.resubscribe_delay;
                }
            }
            Err(e) => warn!("Could not open feed {}: {}", label, e),
        }

        // Hide what the broken feed can no longer vouch for. The conversation feed only
        // hides its view; the index it shares with the full feed stays intact.
        {
            let mut state = state.write().await;
            if !state.accepts(token) {
                return;
            }
            match &pair {
                Some((_, peer_id)) => {
                    state.conversation_stale = true;
                    debug!("Conversation {} hidden until its feed returns", label);
                    events.emit(SyncEvent::ConversationChanged {
                        peer_id: peer_id.clone(),
                    });
                }
                None => {
                    state.index.clear();
                    events.emit(SyncEvent::ViewReset);
                }
            }
        }

        attempts += 1;
        sleep(delay).await;
        delay = (delay * 2).min(config.max_resubscribe_delay);
    }
}
