//! Database row types — these map directly to SQLite rows.
//! Distinct from orbit-types API models to keep the DB layer independent.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use orbit_types::models::{Message, Notification, NotificationKind, RelatedRef};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_id: Option<String>,
    pub last_message_at: Option<String>,
    pub created_at: String,
    /// Live unread count for the querying user, filled by the summary query
    pub unread: u32,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: Option<String>,
    pub media: Option<String>,
    pub media_type: Option<String>,
    pub is_read: bool,
    pub read_at: Option<String>,
    pub created_at: String,
}

pub struct NotificationRow {
    pub id: String,
    pub recipient_id: String,
    pub sender_id: String,
    pub kind: String,
    pub content: String,
    pub related_kind: Option<String>,
    pub related_id: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

/// SQLite stores column defaults as "YYYY-MM-DD HH:MM:SS" without a
/// timezone, while rows written from Rust carry RFC 3339. Accept both.
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| anyhow!("bad timestamp '{}': {}", s, e))
}

fn parse_id(s: &str) -> Result<Uuid> {
    s.parse::<Uuid>().map_err(|e| anyhow!("bad id '{}': {}", s, e))
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_id(&self.id)?,
            conversation_id: parse_id(&self.conversation_id)?,
            sender_id: parse_id(&self.sender_id)?,
            receiver_id: parse_id(&self.receiver_id)?,
            content: self.content,
            media: self.media,
            media_type: self.media_type,
            is_read: self.is_read,
            read_at: self.read_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl NotificationRow {
    pub fn into_notification(self) -> Result<Notification> {
        let related = match (&self.related_kind, &self.related_id) {
            (Some(kind), Some(id)) => RelatedRef::from_parts(kind, parse_id(id)?),
            _ => None,
        };
        Ok(Notification {
            id: parse_id(&self.id)?,
            recipient_id: parse_id(&self.recipient_id)?,
            sender_id: parse_id(&self.sender_id)?,
            kind: NotificationKind::parse(&self.kind)
                .ok_or_else(|| anyhow!("unknown notification kind '{}'", self.kind))?,
            content: self.content,
            related,
            is_read: self.is_read,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}
