use std::collections::HashSet;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};
use uuid::Uuid;

use orbit_types::events::{GatewayCommand, GatewayEvent};

/// Owns the one gateway connection for an authenticated session.
///
/// The online-user set is maintained purely from `user-online` /
/// `user-offline` events. After a reconnect it starts from the server's
/// snapshot and is only as fresh as the events received since; there is
/// no replay.
pub struct SocketSubscriber {
    user_id: Uuid,
    online: Arc<RwLock<HashSet<Uuid>>>,
    events: mpsc::UnboundedReceiver<GatewayEvent>,
    commands: mpsc::UnboundedSender<GatewayCommand>,
}

impl SocketSubscriber {
    pub async fn connect(url: &str, user_id: Uuid) -> anyhow::Result<Self> {
        let (ws, _) = connect_async(url).await?;
        let (mut sink, mut stream) = ws.split();

        // join is the first frame on the wire
        let join = serde_json::to_string(&GatewayCommand::Join { user_id })?;
        sink.send(WsMessage::text(join)).await?;

        let online: Arc<RwLock<HashSet<Uuid>>> = Arc::new(RwLock::new(HashSet::new()));
        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, mut cmd_rx) = mpsc::unbounded_channel::<GatewayCommand>();

        // Writer: serialize queued commands onto the socket
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let text = match serde_json::to_string(&cmd) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("unserializable command: {}", e);
                        continue;
                    }
                };
                if sink.send(WsMessage::text(text)).await.is_err() {
                    break;
                }
            }
        });

        // Reader: fold presence events into the online set, forward the rest
        let online_reader = online.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                let WsMessage::Text(text) = msg else { continue };
                match serde_json::from_str::<GatewayEvent>(&text) {
                    Ok(event) => {
                        match &event {
                            GatewayEvent::UserOnline { user_id } => {
                                online_reader.write().await.insert(*user_id);
                            }
                            GatewayEvent::UserOffline { user_id } => {
                                online_reader.write().await.remove(user_id);
                            }
                            _ => {}
                        }
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("bad gateway event: {}", e),
                }
            }
            info!("gateway connection closed");
        });

        Ok(Self {
            user_id,
            online,
            events,
            commands,
        })
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Next event from the gateway; `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<GatewayEvent> {
        self.events.recv().await
    }

    /// Snapshot of who this session believes is online.
    pub async fn online_users(&self) -> HashSet<Uuid> {
        self.online.read().await.clone()
    }

    pub fn send_message(&self, receiver_id: Uuid, message: String) {
        let _ = self.commands.send(GatewayCommand::SendMessage {
            receiver_id,
            message,
        });
    }

    pub fn typing(&self, receiver_id: Uuid) {
        let _ = self.commands.send(GatewayCommand::Typing {
            user_id: self.user_id,
            receiver_id,
        });
    }

    pub fn stop_typing(&self, receiver_id: Uuid) {
        let _ = self.commands.send(GatewayCommand::StopTyping {
            user_id: self.user_id,
            receiver_id,
        });
    }
}
