use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Notification};

/// Events sent from the server over the gateway.
///
/// Delivery is push-if-present: events for users without a live connection
/// are dropped, never queued. Anything that must survive an offline
/// recipient is persisted before a push is attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayEvent {
    /// Handshake ack: the session is joined and will receive events
    Joined { user_id: Uuid },

    /// A new message in one of the session user's conversations (targeted)
    ReceiveMessage {
        conversation_id: Uuid,
        message: Message,
    },

    /// A persisted notification pushed live to its recipient (targeted)
    ReceiveNotification { notification: Notification },

    /// The other party started typing (targeted)
    UserTyping { user_id: Uuid },

    /// The other party stopped typing (targeted)
    UserStopTyping { user_id: Uuid },

    /// A user gained a live connection (broadcast)
    UserOnline { user_id: Uuid },

    /// A user lost their live connection (broadcast)
    UserOffline { user_id: Uuid },
}

/// Commands sent from a client to the server over the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayCommand {
    /// Bind this connection to a user. Must be the first command; the
    /// session stays in the handshake state until it arrives.
    Join { user_id: Uuid },

    /// Send a text message to another user
    SendMessage { receiver_id: Uuid, message: String },

    /// Typing indicator. `user_id` is carried for wire compatibility but
    /// the server always uses the joined session identity.
    Typing { user_id: Uuid, receiver_id: Uuid },

    StopTyping { user_id: Uuid, receiver_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_are_kebab_case() {
        let cmd = GatewayCommand::SendMessage {
            receiver_id: Uuid::nil(),
            message: "hi".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"send-message\""), "{json}");

        let event = GatewayEvent::UserOffline { user_id: Uuid::nil() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"user-offline\""), "{json}");
    }

    #[test]
    fn test_join_round_trip() {
        let user_id = Uuid::new_v4();
        let json = serde_json::to_string(&GatewayCommand::Join { user_id }).unwrap();
        match serde_json::from_str::<GatewayCommand>(&json).unwrap() {
            GatewayCommand::Join { user_id: parsed } => assert_eq!(parsed, user_id),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
