use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use orbit_types::events::GatewayEvent;

/// One live connection for a user: the connection id plus the targeted
/// send half for that session.
struct PresenceEntry {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// Presence registry and event channel in one service object.
///
/// Tracks which users currently have a live connection and owns the two
/// delivery primitives: `broadcast` (every connected client) and
/// `send_to_user` (targeted, dropped when the user is offline).
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel: all connected clients receive these events
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// user_id -> live connection. One entry per user; a newer connection
    /// for the same user overwrites the older one (last-connect wins).
    presence: RwLock<HashMap<Uuid, PresenceEntry>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                presence: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to broadcast events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a live connection for `user_id` and announce it.
    /// Overwrites any previous connection for the same user; the replaced
    /// session's targeted channel closes, which ends its send loop.
    /// Returns (conn_id, targeted event receiver).
    pub async fn join(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .presence
            .write()
            .await
            .insert(user_id, PresenceEntry { conn_id, tx });

        self.broadcast(GatewayEvent::UserOnline { user_id });

        (conn_id, rx)
    }

    /// Connection id for a user, if they are online.
    pub async fn lookup(&self, user_id: Uuid) -> Option<Uuid> {
        self.inner
            .presence
            .read()
            .await
            .get(&user_id)
            .map(|entry| entry.conn_id)
    }

    /// Remove a connection and announce the owner going offline.
    ///
    /// The owning user is found by scanning the map, O(n) in the number of
    /// online users, fine at this scale. A connection that was already
    /// replaced by a newer one for the same user is not in the map anymore,
    /// so removing it is a no-op and no offline event is sent.
    pub async fn remove_connection(&self, conn_id: Uuid) -> Option<Uuid> {
        let user_id = {
            let mut presence = self.inner.presence.write().await;
            let owner = presence
                .iter()
                .find(|(_, entry)| entry.conn_id == conn_id)
                .map(|(user_id, _)| *user_id)?;
            presence.remove(&owner);
            owner
        };

        self.broadcast(GatewayEvent::UserOffline { user_id });
        Some(user_id)
    }

    /// Send a targeted event to a user. Dropped silently when offline.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let presence = self.inner.presence.read().await;
        if let Some(entry) = presence.get(&user_id) {
            let _ = entry.tx.send(event);
        }
    }

    /// Snapshot of currently online users.
    pub async fn online_users(&self) -> Vec<Uuid> {
        self.inner.presence.read().await.keys().copied().collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_events(rx: &mut broadcast::Receiver<GatewayEvent>) -> Vec<Uuid> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let GatewayEvent::UserOffline { user_id } = event {
                seen.push(user_id);
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_join_lookup_remove() {
        let dispatcher = Dispatcher::new();
        let mut events = dispatcher.subscribe();
        let user = Uuid::new_v4();

        let (conn_id, _rx) = dispatcher.join(user).await;
        assert_eq!(dispatcher.lookup(user).await, Some(conn_id));

        assert_eq!(dispatcher.remove_connection(conn_id).await, Some(user));
        assert_eq!(dispatcher.lookup(user).await, None);

        // Exactly one offline broadcast
        assert_eq!(offline_events(&mut events), vec![user]);
    }

    #[tokio::test]
    async fn test_last_connect_wins() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (old_conn, _old_rx) = dispatcher.join(user).await;
        let (new_conn, _new_rx) = dispatcher.join(user).await;
        assert_ne!(old_conn, new_conn);

        let mut events = dispatcher.subscribe();

        // The stale connection no longer owns the mapping: removing it must
        // not kick the newer session or announce anything.
        assert_eq!(dispatcher.remove_connection(old_conn).await, None);
        assert_eq!(dispatcher.lookup(user).await, Some(new_conn));
        assert!(offline_events(&mut events).is_empty());

        assert_eq!(dispatcher.remove_connection(new_conn).await, Some(user));
        assert_eq!(offline_events(&mut events), vec![user]);
    }

    #[tokio::test]
    async fn test_send_to_user_is_targeted() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_, mut alice_rx) = dispatcher.join(alice).await;
        let (_, mut bob_rx) = dispatcher.join(bob).await;

        dispatcher
            .send_to_user(bob, GatewayEvent::UserTyping { user_id: alice })
            .await;

        match bob_rx.try_recv() {
            Ok(GatewayEvent::UserTyping { user_id }) => assert_eq!(user_id, alice),
            other => panic!("expected typing event, got {other:?}"),
        }
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_offline_user_is_dropped() {
        let dispatcher = Dispatcher::new();
        // No join: nothing to assert beyond "does not hang or panic"
        dispatcher
            .send_to_user(Uuid::new_v4(), GatewayEvent::UserTyping { user_id: Uuid::new_v4() })
            .await;
    }

    #[tokio::test]
    async fn test_online_users_snapshot() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_, _a) = dispatcher.join(alice).await;
        let (conn_b, _b) = dispatcher.join(bob).await;

        let mut online = dispatcher.online_users().await;
        online.sort();
        let mut expected = vec![alice, bob];
        expected.sort();
        assert_eq!(online, expected);

        dispatcher.remove_connection(conn_b).await;
        assert_eq!(dispatcher.online_users().await, vec![alice]);
    }
}
