use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use orbit_db::Database;
use orbit_types::events::GatewayEvent;
use orbit_types::models::Message;

use crate::dispatcher::Dispatcher;
use crate::notify::NotificationService;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message requires content or media")]
    MissingBody,
    #[error("receiver does not exist")]
    UnknownReceiver,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// The one send-message flow, shared by the ws command and the REST
/// handler: validate, resolve the receiver, persist (find-or-create the
/// conversation under the canonical pair key), deliver to the two
/// participants, then fire the best-effort notification.
pub async fn send_message(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    notifier: &NotificationService,
    sender_id: Uuid,
    receiver_id: Uuid,
    content: Option<String>,
    media: Option<String>,
    media_type: Option<String>,
) -> Result<(Uuid, Message), SendError> {
    let has_content = content.as_deref().is_some_and(|c| !c.trim().is_empty());
    if !has_content && media.is_none() {
        return Err(SendError::MissingBody);
    }

    let receiver_exists = {
        let db = db.clone();
        tokio::task::spawn_blocking(move || db.get_user_by_id(&receiver_id.to_string()))
            .await
            .map_err(|e| anyhow!("spawn_blocking join error: {e}"))??
            .is_some()
    };
    if !receiver_exists {
        return Err(SendError::UnknownReceiver);
    }

    let message_id = Uuid::new_v4();
    let candidate_conversation = Uuid::new_v4();
    let now = Utc::now();

    let (conversation_id, row) = {
        let db = db.clone();
        tokio::task::spawn_blocking(move || {
            db.record_message(
                &message_id.to_string(),
                &candidate_conversation.to_string(),
                &sender_id.to_string(),
                &receiver_id.to_string(),
                content.as_deref(),
                media.as_deref(),
                media_type.as_deref(),
                &now.to_rfc3339(),
            )
        })
        .await
        .map_err(|e| anyhow!("spawn_blocking join error: {e}"))??
    };

    let conversation_id: Uuid = conversation_id
        .parse()
        .map_err(|e| anyhow!("corrupt conversation id: {e}"))?;
    let message = row.into_message()?;

    // Targeted delivery: the two participants, nobody else
    let event = GatewayEvent::ReceiveMessage {
        conversation_id,
        message: message.clone(),
    };
    dispatcher.send_to_user(receiver_id, event.clone()).await;
    dispatcher.send_to_user(sender_id, event).await;

    // Already durable; a dropped notification is invisible to the sender
    notifier.notify_message(receiver_id, sender_id).await;

    Ok((conversation_id, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<Database>, Dispatcher, NotificationService) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new();
        let notifier = NotificationService::new(db.clone(), dispatcher.clone());
        (db, dispatcher, notifier)
    }

    fn add_user(db: &Database, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), username, "hash").unwrap();
        id
    }

    #[tokio::test]
    async fn test_requires_content_or_media() {
        let (db, dispatcher, notifier) = setup();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");

        let err = send_message(&db, &dispatcher, &notifier, alice, bob, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::MissingBody));

        let err = send_message(
            &db, &dispatcher, &notifier, alice, bob,
            Some("   ".into()), None, None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SendError::MissingBody));

        // Media alone is enough
        send_message(
            &db, &dispatcher, &notifier, alice, bob,
            None, Some("https://media.example/abc".into()), Some("image".into()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_unknown_receiver() {
        let (db, dispatcher, notifier) = setup();
        let alice = add_user(&db, "alice");

        let err = send_message(
            &db, &dispatcher, &notifier, alice, Uuid::new_v4(),
            Some("hello?".into()), None, None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SendError::UnknownReceiver));
    }

    #[tokio::test]
    async fn test_conversation_reused_across_sends() {
        let (db, dispatcher, notifier) = setup();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");

        let (conv1, first) = send_message(
            &db, &dispatcher, &notifier, alice, bob, Some("hello".into()), None, None,
        )
        .await
        .unwrap();
        let (conv2, second) = send_message(
            &db, &dispatcher, &notifier, bob, alice, Some("hi!".into()), None, None,
        )
        .await
        .unwrap();

        assert_eq!(conv1, conv2);
        assert_ne!(first.id, second.id);
        assert!(!first.is_read);
    }

    #[tokio::test]
    async fn test_delivery_is_targeted_to_participants() {
        let (db, dispatcher, notifier) = setup();
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        let carol = add_user(&db, "carol");

        let (_, mut alice_rx) = dispatcher.join(alice).await;
        let (_, mut bob_rx) = dispatcher.join(bob).await;
        let (_, mut carol_rx) = dispatcher.join(carol).await;

        let (conversation_id, _) = send_message(
            &db, &dispatcher, &notifier, alice, bob, Some("psst".into()), None, None,
        )
        .await
        .unwrap();

        // Both participants get the message event
        for rx in [&mut alice_rx, &mut bob_rx] {
            match rx.try_recv() {
                Ok(GatewayEvent::ReceiveMessage { conversation_id: cid, message }) => {
                    assert_eq!(cid, conversation_id);
                    assert_eq!(message.content.as_deref(), Some("psst"));
                }
                other => panic!("expected message event, got {other:?}"),
            }
        }

        // Receiver also gets the message notification push
        match bob_rx.try_recv() {
            Ok(GatewayEvent::ReceiveNotification { notification }) => {
                assert_eq!(notification.sender_id, alice);
            }
            other => panic!("expected notification push, got {other:?}"),
        }

        // A bystander sees nothing
        assert!(carol_rx.try_recv().is_err());
    }
}
