use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// A two-party conversation. Participants are stored in canonical order
/// (sorted by id) so each unordered pair maps to exactly one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    pub last_message_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: Option<String>,
    /// Reference to an already-uploaded media object (owned by the media
    /// service), never raw bytes.
    pub media: Option<String>,
    pub media_type: Option<String>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
    Message,
    Story,
    Mention,
    Post,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Follow => "follow",
            Self::Message => "message",
            Self::Story => "story",
            Self::Mention => "mention",
            Self::Post => "post",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "like" => Some(Self::Like),
            "comment" => Some(Self::Comment),
            "follow" => Some(Self::Follow),
            "message" => Some(Self::Message),
            "story" => Some(Self::Story),
            "mention" => Some(Self::Mention),
            "post" => Some(Self::Post),
            _ => None,
        }
    }
}

/// What a notification points at. Each kind is fetched through its own
/// collaborator, so the reference carries the kind explicitly instead of a
/// free-form id/type string pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum RelatedRef {
    Post(Uuid),
    Comment(Uuid),
    Story(Uuid),
    User(Uuid),
}

impl RelatedRef {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Post(_) => "post",
            Self::Comment(_) => "comment",
            Self::Story(_) => "story",
            Self::User(_) => "user",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Post(id) | Self::Comment(id) | Self::Story(id) | Self::User(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "post" => Some(Self::Post(id)),
            "comment" => Some(Self::Comment(id)),
            "story" => Some(Self::Story(id)),
            "user" => Some(Self::User(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub sender_id: Uuid,
    pub kind: NotificationKind,
    pub content: String,
    pub related: Option<RelatedRef>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
