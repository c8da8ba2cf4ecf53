/// dmsync demo - two viewers talking through an in-memory store
use colored::*;
use dmsync_core::directory::{FollowGraph, PeerProfile};
use dmsync_core::presence::{spawn_presence_ticker, PresenceEstimator, PresenceTracker};
use dmsync_core::{ConversationSync, MemoryStore, SyncConfig, SyncEvent, Viewer};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let (config, names) = SyncConfig::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let me = names.first().cloned().unwrap_or_else(|| "alice".to_string());
    let peer = names.get(1).cloned().unwrap_or_else(|| "bob".to_string());
    if me == peer {
        anyhow::bail!("Usage: {} [viewer] [peer] [--freshness-secs <n>] [--tick-secs <n>]", args[0]);
    }

    info!("Starting dmsync demo: {} <-> {}", me, peer);
    let store = Arc::new(MemoryStore::new());
    let estimator = PresenceEstimator::new(config.freshness_window);
    let presence_tick = config.presence_tick;

    let mine = ConversationSync::new(store.clone(), config.clone());
    let theirs = ConversationSync::new(store.clone(), config);
    let mut my_events = mine.subscribe_events();

    mine.set_viewer(Some(Viewer::new(&me).with_display_name(capitalize(&me)))).await;
    theirs.set_viewer(Some(Viewer::new(&peer).with_display_name(capitalize(&peer)))).await;
    mine.select_peer(Some(peer.clone())).await;

    mine.send_message("hi", &peer).await?;
    theirs.send_message("hey there", &me).await?;
    theirs.send_message("are you around?", &me).await?;
    settle(&mut my_events).await;

    let mut graph = FollowGraph::new();
    graph.follow(&me, &peer);
    let profiles = vec![
        PeerProfile {
            last_seen: Some(chrono::Utc::now()),
            ..PeerProfile::new(&peer, capitalize(&peer))
        },
        PeerProfile::new("carol", "Carol"),
    ];
    let mut tracker = PresenceTracker::new(estimator);
    for profile in &profiles {
        tracker.update_last_seen(&profile.uid, profile.last_seen);
    }
    let (presence_tx, mut presence_rx) = broadcast::channel(64);
    let ticker = spawn_presence_ticker(Arc::new(RwLock::new(tracker)), presence_tick, presence_tx);
    // The first tick fires immediately and reports every tracked peer
    while let Ok(Ok(change)) = timeout(Duration::from_millis(100), presence_rx.recv()).await {
        info!("{} is {}", change.peer_id, if change.online { "online" } else { "offline" });
    }

    println!("{}", format!("Conversation {} <-> {}", me, peer).bright_cyan().bold());
    for message in mine.active_conversation().await {
        println!("  {} {}", format!("{}:", message.sender_name).bright_white(), message.text);
    }

    print_rows(&mine, &profiles, &graph).await;

    let sweep = mine.mark_read(&peer).await?;
    println!();
    println!("{} {} message(s) marked read", "✓".green().bold(), sweep.marked);
    settle(&mut my_events).await;
    print_rows(&mine, &profiles, &graph).await;

    ticker.abort();
    mine.shutdown().await;
    theirs.shutdown().await;
    Ok(())
}

async fn print_rows(core: &ConversationSync, profiles: &[PeerProfile], graph: &FollowGraph) {
    println!();
    println!("{}", "Peers".bright_white().bold());
    for row in core.peer_rows(profiles, graph, "").await {
        let dot = if row.online { "●".green() } else { "○".dimmed() };
        let unread = if row.unread > 0 {
            format!(" ({} unread)", row.unread).yellow().bold().to_string()
        } else {
            String::new()
        };
        let follow = if row.following { " ★" } else { "" };
        println!(
            "  {} {}{}{}  {}  {}",
            dot,
            row.profile.display_name.cyan(),
            follow,
            unread,
            row.last_seen_text.dimmed(),
            row.last_preview.unwrap_or_default()
        );
    }
}

/// Wait until the feed goes quiet
async fn settle(events: &mut broadcast::Receiver<SyncEvent>) {
    while let Ok(Ok(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        if let Ok(json) = event.to_json() {
            debug!("event {}", json);
        }
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
