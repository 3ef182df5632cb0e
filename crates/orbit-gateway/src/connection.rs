use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use orbit_db::Database;
use orbit_types::events::{GatewayCommand, GatewayEvent};

use crate::delivery;
use crate::dispatcher::Dispatcher;
use crate::notify::NotificationService;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a freshly opened connection may sit in the handshake state
/// before sending its join command.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one WebSocket session through its lifecycle: opened, joined
/// (client bound a user id), active (events flow both ways), closed.
/// Nothing is replayed to a session that reconnects after closing.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    notifier: NotificationService,
) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: wait for the join command
    let user_id = match wait_for_join(&mut receiver).await {
        Some(id) => id,
        None => {
            warn!("gateway client never joined, closing");
            return;
        }
    };

    // The claimed identifier must resolve to a real user
    let known = {
        let db = db.clone();
        tokio::task::spawn_blocking(move || db.get_user_by_id(&user_id.to_string())).await
    };
    match known {
        Ok(Ok(Some(_))) => {}
        Ok(Ok(None)) => {
            warn!("gateway join for unknown user {}, closing", user_id);
            return;
        }
        Ok(Err(e)) => {
            warn!("gateway join lookup failed: {:#}", e);
            return;
        }
        Err(e) => {
            warn!("gateway join lookup task failed: {}", e);
            return;
        }
    }

    info!("{} connected to gateway", user_id);

    // Step 2: ack the join
    let joined = GatewayEvent::Joined { user_id };
    if sender
        .send(Message::Text(serde_json::to_string(&joined).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Send the current online users so the new session starts with a warm
    // set. After this, the set is only as fresh as the events it receives.
    for online in dispatcher.online_users().await {
        let event = GatewayEvent::UserOnline { user_id: online };
        if sender
            .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    // Step 3: go online (broadcasts user-online to everyone else)
    let (conn_id, mut user_rx) = dispatcher.join(user_id).await;
    let mut broadcast_rx = dispatcher.subscribe();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events to the client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if sender.send(Message::Text(serde_json::to_string(&event).unwrap().into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        // Channel replaced by a newer connection for this user
                        None => break,
                    };

                    if sender.send(Message::Text(serde_json::to_string(&event).unwrap().into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client
    let dispatcher_recv = dispatcher.clone();
    let db_recv = db.clone();
    let notifier_recv = notifier.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, &db_recv, &notifier_recv, user_id, cmd)
                            .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Announces user-offline unless a newer connection took over
    dispatcher.remove_connection(conn_id).await;
    info!("{} disconnected from gateway", user_id);
}

async fn wait_for_join(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Option<Uuid> {
    let timeout = tokio::time::timeout(JOIN_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Join { user_id }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    return Some(user_id);
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    notifier: &NotificationService,
    user_id: Uuid,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Join { .. } => {} // Already handled

        GatewayCommand::SendMessage {
            receiver_id,
            message,
        } => {
            // The session identity is the sender, whatever the payload says
            if let Err(e) = delivery::send_message(
                db,
                dispatcher,
                notifier,
                user_id,
                receiver_id,
                Some(message),
                None,
                None,
            )
            .await
            {
                warn!("{} ws send to {} failed: {}", user_id, receiver_id, e);
            }
        }

        GatewayCommand::Typing { receiver_id, .. } => {
            dispatcher
                .send_to_user(receiver_id, GatewayEvent::UserTyping { user_id })
                .await;
        }

        GatewayCommand::StopTyping { receiver_id, .. } => {
            dispatcher
                .send_to_user(receiver_id, GatewayEvent::UserStopTyping { user_id })
                .await;
        }
    }
}
