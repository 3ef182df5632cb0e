use crate::Database;
use crate::models::{ConversationRow, MessageRow, NotificationRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;

/// Sort a participant pair into canonical order. Every unordered pair maps
/// to exactly one (a, b) with a < b, which is what the UNIQUE constraint on
/// conversations keys on.
pub fn canonical_pair<'a>(x: &'a str, y: &'a str) -> (&'a str, &'a str) {
    if x <= y { (x, y) } else { (y, x) }
}

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Conversations --

    /// Find the conversation for an unordered pair, creating it if absent.
    /// `candidate_id` is used only when a new row is inserted. Returns
    /// (conversation_id, created).
    pub fn find_or_create_conversation(
        &self,
        candidate_id: &str,
        user_x: &str,
        user_y: &str,
        now: &str,
    ) -> Result<(String, bool)> {
        self.with_conn(|conn| find_or_create_conversation(conn, candidate_id, user_x, user_y, now))
    }

    /// List conversations containing `user_id`, most recent first, each with
    /// its unread count computed live at query time.
    pub fn get_conversations(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.participant_a, c.participant_b,
                        c.last_message_id, c.last_message_at, c.created_at,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id
                            AND m.receiver_id = ?1
                            AND m.is_read = 0) AS unread
                 FROM conversations c
                 WHERE c.participant_a = ?1 OR c.participant_b = ?1
                 ORDER BY c.last_message_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        participant_a: row.get(1)?,
                        participant_b: row.get(2)?,
                        last_message_id: row.get(3)?,
                        last_message_at: row.get(4)?,
                        created_at: row.get(5)?,
                        unread: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Messages --

    /// Persist one message: find-or-create the conversation for the pair,
    /// insert the row, and advance the conversation's last-message marker.
    /// One lock acquisition, so a concurrent send cannot interleave between
    /// the lookup and the insert.
    pub fn record_message(
        &self,
        message_id: &str,
        candidate_conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: Option<&str>,
        media: Option<&str>,
        media_type: Option<&str>,
        now: &str,
    ) -> Result<(String, MessageRow)> {
        self.with_conn(|conn| {
            let (conversation_id, _created) =
                find_or_create_conversation(conn, candidate_conversation_id, sender_id, receiver_id, now)?;

            conn.execute(
                "INSERT INTO messages
                    (id, conversation_id, sender_id, receiver_id, content, media, media_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    message_id,
                    conversation_id,
                    sender_id,
                    receiver_id,
                    content,
                    media,
                    media_type,
                    now
                ],
            )?;

            conn.execute(
                "UPDATE conversations SET last_message_id = ?1, last_message_at = ?2 WHERE id = ?3",
                rusqlite::params![message_id, now, conversation_id],
            )?;

            let row = MessageRow {
                id: message_id.to_string(),
                conversation_id: conversation_id.clone(),
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.to_string(),
                content: content.map(str::to_string),
                media: media.map(str::to_string),
                media_type: media_type.map(str::to_string),
                is_read: false,
                read_at: None,
                created_at: now.to_string(),
            };

            Ok((conversation_id, row))
        })
    }

    /// Full bidirectional history between two users, oldest first.
    pub fn get_thread(&self, self_id: &str, other_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender_id, receiver_id, content, media,
                        media_type, is_read, read_at, created_at
                 FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at ASC",
            )?;

            let rows = stmt
                .query_map([self_id, other_id], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Mark everything unread from `other_id` to `self_id` as read.
    /// Returns the number of messages flipped.
    pub fn mark_thread_read(&self, self_id: &str, other_id: &str, read_at: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET is_read = 1, read_at = ?3
                 WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0",
                rusqlite::params![self_id, other_id, read_at],
            )?;
            Ok(n)
        })
    }

    pub fn unread_total(&self, user_id: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    /// Unread counts grouped per conversation, with the sender the unread
    /// messages came from.
    pub fn unread_by_conversation(&self, user_id: &str) -> Result<Vec<(String, String, u32)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, sender_id, COUNT(*)
                 FROM messages
                 WHERE receiver_id = ?1 AND is_read = 0
                 GROUP BY conversation_id, sender_id",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender_id, receiver_id, content, media,
                        media_type, is_read, read_at, created_at
                 FROM messages WHERE id = ?1",
            )?;
            let row = stmt.query_row([id], map_message_row).optional()?;
            Ok(row)
        })
    }

    pub fn delete_message(&self, id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(n)
        })
    }

    // -- Notifications --

    pub fn insert_notification(
        &self,
        id: &str,
        recipient_id: &str,
        sender_id: &str,
        kind: &str,
        content: &str,
        related_kind: Option<&str>,
        related_id: Option<&str>,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications
                    (id, recipient_id, sender_id, kind, content, related_kind, related_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![id, recipient_id, sender_id, kind, content, related_kind, related_id, now],
            )?;
            Ok(())
        })
    }

    pub fn list_notifications(
        &self,
        recipient_id: &str,
        unread_only: bool,
        limit: u32,
        skip: u32,
    ) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let sql = if unread_only {
                "SELECT id, recipient_id, sender_id, kind, content, related_kind, related_id,
                        is_read, created_at
                 FROM notifications
                 WHERE recipient_id = ?1 AND is_read = 0
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            } else {
                "SELECT id, recipient_id, sender_id, kind, content, related_kind, related_id,
                        is_read, created_at
                 FROM notifications
                 WHERE recipient_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            };

            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(rusqlite::params![recipient_id, limit, skip], map_notification_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn notification_unread_count(&self, recipient_id: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND is_read = 0",
                [recipient_id],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    pub fn get_notification(&self, id: &str) -> Result<Option<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, recipient_id, sender_id, kind, content, related_kind, related_id,
                        is_read, created_at
                 FROM notifications WHERE id = ?1",
            )?;
            let row = stmt.query_row([id], map_notification_row).optional()?;
            Ok(row)
        })
    }

    pub fn mark_notification_read(&self, id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute("UPDATE notifications SET is_read = 1 WHERE id = ?1", [id])?;
            Ok(n)
        })
    }

    pub fn mark_all_notifications_read(&self, recipient_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND is_read = 0",
                [recipient_id],
            )?;
            Ok(n)
        })
    }

    pub fn delete_notification(&self, id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM notifications WHERE id = ?1", [id])?;
            Ok(n)
        })
    }

    pub fn clear_notifications(&self, recipient_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM notifications WHERE recipient_id = ?1",
                [recipient_id],
            )?;
            Ok(n)
        })
    }
}

fn find_or_create_conversation(
    conn: &Connection,
    candidate_id: &str,
    user_x: &str,
    user_y: &str,
    now: &str,
) -> Result<(String, bool)> {
    let (a, b) = canonical_pair(user_x, user_y);

    // The UNIQUE(participant_a, participant_b) constraint makes this a
    // no-op when the pair already has a conversation.
    let inserted = conn.execute(
        "INSERT INTO conversations (id, participant_a, participant_b, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(participant_a, participant_b) DO NOTHING",
        rusqlite::params![candidate_id, a, b, now],
    )?;

    let id: String = conn.query_row(
        "SELECT id FROM conversations WHERE participant_a = ?1 AND participant_b = ?2",
        [a, b],
        |row| row.get(0),
    )?;

    Ok((id, inserted > 0))
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT id, username, password, created_at FROM users WHERE {column} = ?1");
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        content: row.get(4)?,
        media: row.get(5)?,
        media_type: row.get(6)?,
        is_read: row.get::<_, i64>(7)? != 0,
        read_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn map_notification_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<NotificationRow, rusqlite::Error> {
    Ok(NotificationRow {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        sender_id: row.get(2)?,
        kind: row.get(3)?,
        content: row.get(4)?,
        related_kind: row.get(5)?,
        related_id: row.get(6)?,
        is_read: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_db() -> (Database, String, String) {
        let db = Database::open_in_memory().unwrap();
        let alice = Uuid::new_v4().to_string();
        let bob = Uuid::new_v4().to_string();
        db.create_user(&alice, "alice", "hash-a").unwrap();
        db.create_user(&bob, "bob", "hash-b").unwrap();
        (db, alice, bob)
    }

    fn send(db: &Database, from: &str, to: &str, text: &str, at: &str) -> (String, MessageRow) {
        db.record_message(
            &Uuid::new_v4().to_string(),
            &Uuid::new_v4().to_string(),
            from,
            to,
            Some(text),
            None,
            None,
            at,
        )
        .unwrap()
    }

    #[test]
    fn test_one_conversation_per_pair() {
        let (db, alice, bob) = test_db();

        let (conv1, _) = send(&db, &alice, &bob, "hello", "2026-01-01T10:00:00Z");
        // Reply goes the other direction; the pair is the same
        let (conv2, _) = send(&db, &bob, &alice, "hey", "2026-01-01T10:01:00Z");
        assert_eq!(conv1, conv2);

        let conversations = db.get_conversations(&alice).unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].last_message_at.as_deref(), Some("2026-01-01T10:01:00Z"));
    }

    #[test]
    fn test_second_send_advances_last_message() {
        let (db, alice, bob) = test_db();

        let (conv1, first) = send(&db, &alice, &bob, "one", "2026-01-01T10:00:00Z");
        let (conv2, second) = send(&db, &alice, &bob, "two", "2026-01-01T10:05:00Z");
        assert_eq!(conv1, conv2);

        let conversations = db.get_conversations(&bob).unwrap();
        assert_eq!(conversations[0].last_message_id.as_deref(), Some(second.id.as_str()));
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_mark_thread_read_sets_read_at() {
        let (db, alice, bob) = test_db();

        send(&db, &alice, &bob, "hi", "2026-01-01T10:00:00Z");
        let flipped = db
            .mark_thread_read(&bob, &alice, "2026-01-01T10:02:00Z")
            .unwrap();
        assert_eq!(flipped, 1);

        let thread = db.get_thread(&bob, &alice).unwrap();
        assert_eq!(thread.len(), 1);
        assert!(thread[0].is_read);
        assert_eq!(thread[0].read_at.as_deref(), Some("2026-01-01T10:02:00Z"));

        // Marking again flips nothing
        let again = db
            .mark_thread_read(&bob, &alice, "2026-01-01T10:03:00Z")
            .unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_mark_thread_read_only_touches_one_direction() {
        let (db, alice, bob) = test_db();

        send(&db, &alice, &bob, "from alice", "2026-01-01T10:00:00Z");
        send(&db, &bob, &alice, "from bob", "2026-01-01T10:01:00Z");

        db.mark_thread_read(&bob, &alice, "2026-01-01T10:02:00Z").unwrap();

        // Alice's incoming message is still unread
        assert_eq!(db.unread_total(&alice).unwrap(), 1);
        assert_eq!(db.unread_total(&bob).unwrap(), 0);
    }

    #[test]
    fn test_unread_counts_are_live() {
        let (db, alice, bob) = test_db();

        send(&db, &alice, &bob, "one", "2026-01-01T10:00:00Z");
        send(&db, &alice, &bob, "two", "2026-01-01T10:01:00Z");

        let before = db.get_conversations(&bob).unwrap();
        assert_eq!(before[0].unread, 2);

        db.mark_thread_read(&bob, &alice, "2026-01-01T10:02:00Z").unwrap();

        // Recomputed, not cached: the next read reflects the flip immediately
        let after = db.get_conversations(&bob).unwrap();
        assert_eq!(after[0].unread, 0);

        // ...and the sender's own view never counted them
        let alice_view = db.get_conversations(&alice).unwrap();
        assert_eq!(alice_view[0].unread, 0);
    }

    #[test]
    fn test_unread_by_conversation_groups_by_sender() {
        let (db, alice, bob) = test_db();
        let carol = Uuid::new_v4().to_string();
        db.create_user(&carol, "carol", "hash-c").unwrap();

        let (conv_ab, _) = send(&db, &alice, &bob, "hi bob", "2026-01-01T10:00:00Z");
        let (conv_cb, _) = send(&db, &carol, &bob, "hi from carol", "2026-01-01T10:01:00Z");
        send(&db, &carol, &bob, "again", "2026-01-01T10:02:00Z");

        let mut per_conv = db.unread_by_conversation(&bob).unwrap();
        per_conv.sort_by(|l, r| l.2.cmp(&r.2));

        assert_eq!(per_conv.len(), 2);
        assert_eq!(per_conv[0], (conv_ab.clone(), alice.clone(), 1));
        assert_eq!(per_conv[1], (conv_cb.clone(), carol.clone(), 2));

        assert_eq!(db.unread_total(&bob).unwrap(), 3);
    }

    #[test]
    fn test_thread_is_ordered_oldest_first() {
        let (db, alice, bob) = test_db();

        send(&db, &alice, &bob, "first", "2026-01-01T10:00:00Z");
        send(&db, &bob, &alice, "second", "2026-01-01T10:01:00Z");
        send(&db, &alice, &bob, "third", "2026-01-01T10:02:00Z");

        let thread = db.get_thread(&alice, &bob).unwrap();
        let contents: Vec<_> = thread.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(contents, ["first", "second", "third"]);
    }

    #[test]
    fn test_delete_message() {
        let (db, alice, bob) = test_db();

        let (_, msg) = send(&db, &alice, &bob, "oops", "2026-01-01T10:00:00Z");
        assert!(db.get_message(&msg.id).unwrap().is_some());

        assert_eq!(db.delete_message(&msg.id).unwrap(), 1);
        assert!(db.get_message(&msg.id).unwrap().is_none());
        assert_eq!(db.delete_message(&msg.id).unwrap(), 0);
    }

    #[test]
    fn test_notification_lifecycle() {
        let (db, alice, bob) = test_db();

        for (i, kind) in ["like", "comment", "follow"].iter().enumerate() {
            db.insert_notification(
                &Uuid::new_v4().to_string(),
                &bob,
                &alice,
                kind,
                "alice did a thing",
                Some("post"),
                Some(&Uuid::new_v4().to_string()),
                &format!("2026-01-01T10:0{i}:00Z"),
            )
            .unwrap();
        }

        assert_eq!(db.notification_unread_count(&bob).unwrap(), 3);

        // Newest first
        let all = db.list_notifications(&bob, false, 20, 0).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].kind, "follow");

        // Pagination
        let page = db.list_notifications(&bob, false, 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].kind, "comment");

        // Mark one, filter unread
        db.mark_notification_read(&all[0].id).unwrap();
        let unread = db.list_notifications(&bob, true, 20, 0).unwrap();
        assert_eq!(unread.len(), 2);

        // Mark all
        assert_eq!(db.mark_all_notifications_read(&bob).unwrap(), 2);
        assert_eq!(db.notification_unread_count(&bob).unwrap(), 0);

        // Delete one, clear the rest
        assert_eq!(db.delete_notification(&all[0].id).unwrap(), 1);
        assert_eq!(db.clear_notifications(&bob).unwrap(), 2);
        assert!(db.list_notifications(&bob, false, 20, 0).unwrap().is_empty());
    }
}
