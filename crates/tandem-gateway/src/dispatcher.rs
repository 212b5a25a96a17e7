use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use tandem_types::events::ServerEvent;

use crate::presence::Presence;

/// Sender half of one open connection.
pub type ConnectionSender = mpsc::UnboundedSender<ServerEvent>;

/// Manages all connected clients: per-user rooms, presence and broadcasts.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for events every connected client receives
    broadcast_tx: broadcast::Sender<ServerEvent>,

    /// Per-user rooms: user_id -> (conn_id -> sender)
    rooms: RwLock<HashMap<Uuid, HashMap<Uuid, ConnectionSender>>>,

    presence: RwLock<Presence>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                rooms: RwLock::new(HashMap::new()),
                presence: RwLock::new(Presence::new()),
            }),
        }
    }

    /// Subscribe to global events. Subscribe before `connect` to receive the
    /// presence snapshot that includes yourself.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Join the user's room with a new connection, mark the user online and
    /// broadcast the presence snapshot. Returns (conn_id, receiver).
    pub async fn connect(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .rooms
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id, tx);

        let mut presence = self.inner.presence.write().await;
        presence.connect(user_id);
        // Sent under the lock so snapshots go out in mutation order.
        self.broadcast(ServerEvent::OnlineUser(presence.snapshot()));

        (conn_id, rx)
    }

    /// Leave the room and drop one presence reference, then broadcast the
    /// snapshot. Unknown connections are ignored.
    pub async fn disconnect(&self, user_id: Uuid, conn_id: Uuid) {
        let removed = {
            let mut rooms = self.inner.rooms.write().await;
            let removed = rooms
                .get_mut(&user_id)
                .and_then(|room| room.remove(&conn_id))
                .is_some();
            if rooms.get(&user_id).is_some_and(|room| room.is_empty()) {
                rooms.remove(&user_id);
            }
            removed
        };

        if !removed {
            debug!("Disconnect for unknown connection {} of {}", conn_id, user_id);
            return;
        }

        let mut presence = self.inner.presence.write().await;
        presence.disconnect(user_id);
        self.broadcast(ServerEvent::OnlineUser(presence.snapshot()));
    }

    /// Send a targeted event to every connection in the user's room.
    /// A user without open connections is a no-op.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        let rooms = self.inner.rooms.read().await;
        if let Some(room) = rooms.get(&user_id) {
            for tx in room.values() {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Reply to a single connection only.
    pub async fn send_to_connection(&self, user_id: Uuid, conn_id: Uuid, event: ServerEvent) {
        let rooms = self.inner.rooms.read().await;
        if let Some(tx) = rooms.get(&user_id).and_then(|room| room.get(&conn_id)) {
            let _ = tx.send(event);
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.presence.read().await.is_online(user_id)
    }

    /// Get list of online users.
    pub async fn online_users(&self) -> Vec<Uuid> {
        self.inner.presence.read().await.snapshot()
    }

    /// Drop every room and forget presence. Open connections see their
    /// targeted channel close and wind down.
    pub async fn shutdown(&self) {
        self.inner.rooms.write().await.clear();
        self.inner.presence.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_online(rx: &mut broadcast::Receiver<ServerEvent>) -> Vec<Uuid> {
        match rx.try_recv() {
            Ok(ServerEvent::OnlineUser(users)) => users,
            other => panic!("expected onlineUser, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_broadcast_snapshot() {
        let dispatcher = Dispatcher::new();
        let mut global = dispatcher.subscribe();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let (conn_a, _rx_a) = dispatcher.connect(a).await;
        assert_eq!(expect_online(&mut global), vec![a]);

        let (_conn_b, _rx_b) = dispatcher.connect(b).await;
        assert_eq!(expect_online(&mut global), vec![a, b]);

        dispatcher.disconnect(a, conn_a).await;
        assert_eq!(expect_online(&mut global), vec![b]);
        assert!(!dispatcher.is_online(a).await);
    }

    #[tokio::test]
    async fn test_room_fans_out_to_every_connection() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (_c1, mut rx1) = dispatcher.connect(user).await;
        let (_c2, mut rx2) = dispatcher.connect(user).await;

        dispatcher.send_to_user(user, ServerEvent::MessageRead(vec![])).await;
        assert!(matches!(rx1.try_recv(), Ok(ServerEvent::MessageRead(_))));
        assert!(matches!(rx2.try_recv(), Ok(ServerEvent::MessageRead(_))));
    }

    #[tokio::test]
    async fn test_send_to_connection_targets_one_socket() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (c1, mut rx1) = dispatcher.connect(user).await;
        let (_c2, mut rx2) = dispatcher.connect(user).await;

        dispatcher
            .send_to_connection(user, c1, ServerEvent::Conversation(vec![]))
            .await;
        assert!(matches!(rx1.try_recv(), Ok(ServerEvent::Conversation(_))));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_survives_partial_disconnect() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (c1, _rx1) = dispatcher.connect(user).await;
        let (c2, _rx2) = dispatcher.connect(user).await;
        let (c3, _rx3) = dispatcher.connect(user).await;

        dispatcher.disconnect(user, c1).await;
        dispatcher.disconnect(user, c2).await;
        assert!(dispatcher.is_online(user).await);

        // Repeated disconnect of the same connection does not count twice.
        dispatcher.disconnect(user, c2).await;
        assert!(dispatcher.is_online(user).await);

        dispatcher.disconnect(user, c3).await;
        assert!(!dispatcher.is_online(user).await);
    }

    #[tokio::test]
    async fn test_emit_to_closed_or_offline_is_noop() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (_conn, rx) = dispatcher.connect(user).await;
        drop(rx);
        dispatcher.send_to_user(user, ServerEvent::MessageRead(vec![])).await;
        dispatcher
            .send_to_user(Uuid::new_v4(), ServerEvent::MessageRead(vec![]))
            .await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_presence() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (_conn, mut rx) = dispatcher.connect(user).await;

        dispatcher.shutdown().await;
        assert!(dispatcher.online_users().await.is_empty());
        assert!(rx.recv().await.is_none());
    }
}
