use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, NotificationKind, RelatedRef};

// -- JWT Claims --

/// JWT claims shared between the REST middleware and the server binary.
/// Canonical definition lives here to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub receiver_id: Uuid,
    pub content: Option<String>,
    /// Reference to an object already uploaded to the media service
    pub media: Option<String>,
    pub media_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub conversation_id: Uuid,
    pub message: Message,
}

/// One row of the conversation list, with its unread count computed live
/// at query time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    pub last_message_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub unread: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationUnread {
    pub conversation_id: Uuid,
    pub other_id: Uuid,
    pub unread: u32,
}

// -- Notifications --

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    /// When true, only unread notifications are returned
    #[serde(default)]
    pub unread: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub skip: u32,
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub kind: NotificationKind,
    pub content: String,
    pub related: Option<RelatedRef>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
