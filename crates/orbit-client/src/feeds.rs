use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use orbit_types::api::{ConversationUnread, UnreadCountResponse};

/// Unread counter reconciling two sources: push events apply optimistic
/// increments, the periodic poll overwrites with the authoritative value.
/// The two can transiently disagree; the poll always wins on its next tick.
#[derive(Default)]
pub struct UnreadState {
    count: AtomicU32,
}

impl UnreadState {
    pub fn apply_push(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn apply_poll(&self, authoritative: u32) {
        self.count.store(authoritative, Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Per-conversation unread map with the same reconcile rule as
/// [`UnreadState`].
#[derive(Default)]
pub struct ConversationUnreadState {
    per_conversation: RwLock<HashMap<Uuid, u32>>,
}

impl ConversationUnreadState {
    pub fn apply_push(&self, conversation_id: Uuid) {
        let mut map = self.per_conversation.write().expect("unread lock poisoned");
        *map.entry(conversation_id).or_insert(0) += 1;
    }

    /// Replace the whole map: conversations absent from the poll result
    /// have zero unread, so stale optimistic entries are dropped too.
    pub fn apply_poll(&self, authoritative: impl IntoIterator<Item = (Uuid, u32)>) {
        let mut map = self.per_conversation.write().expect("unread lock poisoned");
        *map = authoritative.into_iter().collect();
    }

    pub fn get(&self, conversation_id: Uuid) -> u32 {
        self.per_conversation
            .read()
            .expect("unread lock poisoned")
            .get(&conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.per_conversation
            .read()
            .expect("unread lock poisoned")
            .values()
            .sum()
    }
}

/// Notification feed: optimistic `+1` on each `receive-notification` push,
/// authoritative re-fetch on an independent timer.
pub struct NotificationFeed {
    pub state: Arc<UnreadState>,
    poller: tokio::task::JoinHandle<()>,
}

impl NotificationFeed {
    pub fn start(base_url: String, token: String, interval: Duration) -> Self {
        let state = Arc::new(UnreadState::default());

        let poll_state = state.clone();
        let poller = tokio::spawn(async move {
            let client = reqwest::Client::new();
            let url = format!("{base_url}/notifications/unread/count");
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                match fetch_unread(&client, &url, &token).await {
                    Ok(unread) => poll_state.apply_poll(unread),
                    Err(e) => warn!("notification poll failed: {:#}", e),
                }
            }
        });

        Self { state, poller }
    }

    pub fn apply_push(&self) {
        self.state.apply_push();
    }

    pub fn unread(&self) -> u32 {
        self.state.get()
    }
}

impl Drop for NotificationFeed {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

/// Message feed: per-conversation unread counts, reconciled the same way.
pub struct MessageFeed {
    pub state: Arc<ConversationUnreadState>,
    poller: tokio::task::JoinHandle<()>,
}

impl MessageFeed {
    pub fn start(base_url: String, token: String, interval: Duration) -> Self {
        let state = Arc::new(ConversationUnreadState::default());

        let poll_state = state.clone();
        let poller = tokio::spawn(async move {
            let client = reqwest::Client::new();
            let url = format!("{base_url}/conversations/unread");
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                match fetch_conversation_unread(&client, &url, &token).await {
                    Ok(counts) => poll_state.apply_poll(
                        counts
                            .into_iter()
                            .map(|row| (row.conversation_id, row.unread)),
                    ),
                    Err(e) => warn!("message poll failed: {:#}", e),
                }
            }
        });

        Self { state, poller }
    }

    pub fn apply_push(&self, conversation_id: Uuid) {
        self.state.apply_push(conversation_id);
    }

    pub fn unread(&self, conversation_id: Uuid) -> u32 {
        self.state.get(conversation_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.state.total()
    }
}

impl Drop for MessageFeed {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

async fn fetch_unread(client: &reqwest::Client, url: &str, token: &str) -> anyhow::Result<u32> {
    let resp = client
        .get(url)
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json::<UnreadCountResponse>()
        .await?;
    Ok(resp.unread)
}

async fn fetch_conversation_unread(
    client: &reqwest::Client,
    url: &str,
    token: &str,
) -> anyhow::Result<Vec<ConversationUnread>> {
    let rows = client
        .get(url)
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json::<Vec<ConversationUnread>>()
        .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_increments_between_polls() {
        let state = UnreadState::default();
        state.apply_poll(3);
        state.apply_push();
        state.apply_push();
        assert_eq!(state.get(), 5);
    }

    #[test]
    fn test_poll_always_wins() {
        let state = UnreadState::default();

        // Optimistic pushes drifted past reality (the user read some
        // notifications elsewhere); the authoritative poll overwrites.
        state.apply_push();
        state.apply_push();
        state.apply_push();
        state.apply_poll(1);
        assert_eq!(state.get(), 1);

        // ...including down to zero
        state.apply_push();
        state.apply_poll(0);
        assert_eq!(state.get(), 0);
    }

    #[test]
    fn test_conversation_reconcile_drops_stale_entries() {
        let state = ConversationUnreadState::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        state.apply_push(a);
        state.apply_push(a);
        state.apply_push(b);
        assert_eq!(state.get(a), 2);
        assert_eq!(state.total(), 3);

        // Poll says only `a` has unread now; `b` was read on another device
        state.apply_poll([(a, 2)]);
        assert_eq!(state.get(a), 2);
        assert_eq!(state.get(b), 0);
        assert_eq!(state.total(), 2);
    }
}
