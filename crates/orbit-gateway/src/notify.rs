use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use orbit_db::Database;
use orbit_types::events::GatewayEvent;
use orbit_types::models::{Notification, NotificationKind, RelatedRef};

use crate::dispatcher::Dispatcher;

/// Persists notifications and pushes them to online recipients.
///
/// Outbox-shaped: the insert must succeed before a push is attempted, and
/// the push itself is best-effort (dropped for offline users). Neither step
/// ever fails the caller: a domain action completes whether or not its
/// notification made it.
#[derive(Clone)]
pub struct NotificationService {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl NotificationService {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    /// Persist one notification, then push it if the recipient is online.
    /// Self-notifications are suppressed. Failures are logged and absorbed.
    pub async fn create(
        &self,
        recipient_id: Uuid,
        sender_id: Uuid,
        kind: NotificationKind,
        content: &str,
        related: Option<RelatedRef>,
    ) {
        if recipient_id == sender_id {
            return;
        }

        let record = match self.persist(recipient_id, sender_id, kind, content, related).await {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "dropping {} notification for {}: {:#}",
                    kind.as_str(),
                    recipient_id,
                    e
                );
                return;
            }
        };

        // Durable now; the push is a decoupled best-effort step
        self.dispatcher
            .send_to_user(recipient_id, GatewayEvent::ReceiveNotification {
                notification: record,
            })
            .await;
    }

    async fn persist(
        &self,
        recipient_id: Uuid,
        sender_id: Uuid,
        kind: NotificationKind,
        content: &str,
        related: Option<RelatedRef>,
    ) -> anyhow::Result<Notification> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let db = self.db.clone();
        let content_owned = content.to_string();
        tokio::task::spawn_blocking(move || {
            db.insert_notification(
                &id.to_string(),
                &recipient_id.to_string(),
                &sender_id.to_string(),
                kind.as_str(),
                &content_owned,
                related.map(|r| r.kind()),
                related.map(|r| r.id().to_string()).as_deref(),
                &now.to_rfc3339(),
            )
        })
        .await??;

        Ok(Notification {
            id,
            recipient_id,
            sender_id,
            kind,
            content: content.to_string(),
            related,
            is_read: false,
            created_at: now,
        })
    }

    // -- Domain-action entry points --

    pub async fn notify_like(&self, post_owner: Uuid, liker: Uuid, post_id: Uuid) {
        self.create(
            post_owner,
            liker,
            NotificationKind::Like,
            "liked your post",
            Some(RelatedRef::Post(post_id)),
        )
        .await;
    }

    pub async fn notify_follow(&self, target: Uuid, follower: Uuid) {
        self.create(
            target,
            follower,
            NotificationKind::Follow,
            "started following you",
            Some(RelatedRef::User(follower)),
        )
        .await;
    }

    /// Comment on a post: one `comment` notification for the post owner,
    /// plus one `mention` per user tagged in the comment text. These are
    /// independent; a mentioned post owner gets both.
    pub async fn notify_comment(
        &self,
        post_owner: Uuid,
        author: Uuid,
        post_id: Uuid,
        comment_id: Uuid,
        text: &str,
    ) {
        self.create(
            post_owner,
            author,
            NotificationKind::Comment,
            "commented on your post",
            Some(RelatedRef::Post(post_id)),
        )
        .await;

        self.notify_mentions(author, text, Some(RelatedRef::Comment(comment_id)))
            .await;
    }

    /// New post: a `post` notification per follower, plus mention fan-out
    /// over the caption.
    pub async fn notify_post(&self, author: Uuid, followers: &[Uuid], post_id: Uuid, caption: &str) {
        for &follower in followers {
            self.create(
                follower,
                author,
                NotificationKind::Post,
                "shared a new post",
                Some(RelatedRef::Post(post_id)),
            )
            .await;
        }

        self.notify_mentions(author, caption, Some(RelatedRef::Post(post_id)))
            .await;
    }

    pub async fn notify_story(&self, author: Uuid, followers: &[Uuid], story_id: Uuid) {
        for &follower in followers {
            self.create(
                follower,
                author,
                NotificationKind::Story,
                "added a new story",
                Some(RelatedRef::Story(story_id)),
            )
            .await;
        }
    }

    pub async fn notify_message(&self, receiver: Uuid, sender: Uuid) {
        self.create(
            receiver,
            sender,
            NotificationKind::Message,
            "sent you a message",
            Some(RelatedRef::User(sender)),
        )
        .await;
    }

    /// Resolve `@token` mentions in free text and create one `mention`
    /// notification per resolved user. The author never gets one for
    /// tagging themselves.
    pub async fn notify_mentions(&self, author: Uuid, text: &str, related: Option<RelatedRef>) {
        for username in extract_mentions(text) {
            let db = self.db.clone();
            let lookup = tokio::task::spawn_blocking(move || db.get_user_by_username(&username)).await;

            let user = match lookup {
                Ok(Ok(user)) => user,
                Ok(Err(e)) => {
                    warn!("mention lookup failed: {:#}", e);
                    continue;
                }
                Err(e) => {
                    warn!("mention lookup task failed: {}", e);
                    continue;
                }
            };

            // Unresolved tokens are not an error; people type @things
            let Some(user) = user else { continue };
            let Ok(mentioned) = user.id.parse::<Uuid>() else {
                warn!("corrupt user id '{}' for mention", user.id);
                continue;
            };

            self.create(
                mentioned,
                author,
                NotificationKind::Mention,
                "mentioned you",
                related,
            )
            .await;
        }
    }
}

/// Scan free text for `@token` patterns. Tokens are alphanumeric plus `_`
/// and `.`; duplicates are collapsed, order of first appearance kept.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '@' {
            continue;
        }
        let mut token = String::new();
        while let Some(&(_, next)) = chars.peek() {
            if next.is_alphanumeric() || next == '_' || next == '.' {
                token.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if !token.is_empty() && !found.contains(&token) {
            found.push(token);
        }
    }

    found
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

    #[test]
    fn test_extract_mentions() {
        assert_eq!(extract_mentions("hi @alice and @bob_99!"), ["alice", "bob_99"]);
        assert_eq!(extract_mentions("@a.b trailing dot@"), ["a.b"]);
        assert_eq!(extract_mentions("@dup @dup @dup"), ["dup"]);
        assert!(extract_mentions("no mentions here").is_empty());
        assert!(extract_mentions("lonely @ sign").is_empty());
    }

    #[tokio::test]
    async fn test_like_creates_one_notification() {
        let (db, _dispatcher, notifier) = setup();
        let owner = add_user(&db, "owner");
        let liker = add_user(&db, "liker");
        let post_id = Uuid::new_v4();

        notifier.notify_like(owner, liker, post_id).await;

        let rows = db.list_notifications(&owner.to_string(), false, 20, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "like");
        assert_eq!(rows[0].sender_id, liker.to_string());
        assert_eq!(rows[0].related_kind.as_deref(), Some("post"));
        assert_eq!(rows[0].related_id.as_deref(), Some(post_id.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_self_like_is_suppressed() {
        let (db, _dispatcher, notifier) = setup();
        let owner = add_user(&db, "owner");

        notifier.notify_like(owner, owner, Uuid::new_v4()).await;

        assert!(db.list_notifications(&owner.to_string(), false, 20, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_comment_mentions_fan_out() {
        let (db, _dispatcher, notifier) = setup();
        let owner = add_user(&db, "owner");
        let author = add_user(&db, "author");
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");

        notifier
            .notify_comment(
                owner,
                author,
                Uuid::new_v4(),
                Uuid::new_v4(),
                "nice shot @alice @bob @author @ghost",
            )
            .await;

        // Post owner gets the comment notification
        let owner_rows = db.list_notifications(&owner.to_string(), false, 20, 0).unwrap();
        assert_eq!(owner_rows.len(), 1);
        assert_eq!(owner_rows[0].kind, "comment");

        // Each mentioned existing user gets exactly one mention
        for mentioned in [alice, bob] {
            let rows = db.list_notifications(&mentioned.to_string(), false, 20, 0).unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].kind, "mention");
        }

        // Mentioning yourself creates nothing; @ghost resolves to nobody
        assert!(db.list_notifications(&author.to_string(), false, 20, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mentioned_post_owner_gets_both() {
        let (db, _dispatcher, notifier) = setup();
        let owner = add_user(&db, "owner");
        let author = add_user(&db, "author");

        notifier
            .notify_comment(owner, author, Uuid::new_v4(), Uuid::new_v4(), "cc @owner")
            .await;

        let rows = db.list_notifications(&owner.to_string(), false, 20, 0).unwrap();
        let mut kinds: Vec<_> = rows.iter().map(|r| r.kind.as_str()).collect();
        kinds.sort();
        assert_eq!(kinds, ["comment", "mention"]);
    }

    #[tokio::test]
    async fn test_push_reaches_online_recipient() {
        let (db, dispatcher, notifier) = setup();
        let owner = add_user(&db, "owner");
        let liker = add_user(&db, "liker");

        let (_conn, mut rx) = dispatcher.join(owner).await;

        notifier.notify_like(owner, liker, Uuid::new_v4()).await;

        match rx.try_recv() {
            Ok(GatewayEvent::ReceiveNotification { notification }) => {
                assert_eq!(notification.kind, NotificationKind::Like);
                assert_eq!(notification.recipient_id, owner);
                assert!(!notification.is_read);
            }
            other => panic!("expected pushed notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_persist_failure_is_absorbed() {
        let (db, _dispatcher, notifier) = setup();
        let real = add_user(&db, "real");
        // Recipient does not exist; the FK constraint rejects the insert.
        // The caller must not see an error.
        let ghost = Uuid::new_v4();

        notifier.notify_follow(ghost, real).await;

        assert!(db.list_notifications(&ghost.to_string(), false, 20, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_story_fan_out_skips_author() {
        let (db, _dispatcher, notifier) = setup();
        let author = add_user(&db, "author");
        let fan = add_user(&db, "fan");

        notifier.notify_story(author, &[fan, author], Uuid::new_v4()).await;

        assert_eq!(db.list_notifications(&fan.to_string(), false, 20, 0).unwrap().len(), 1);
        assert!(db.list_notifications(&author.to_string(), false, 20, 0).unwrap().is_empty());
    }
}
