use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use orbit_db::models::{ConversationRow, parse_ts};
use orbit_gateway::delivery::{self, SendError};
use orbit_types::api::{
    Claims, ConversationSummary, ConversationUnread, SendMessageRequest, SendMessageResponse,
    UnreadCountResponse,
};

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (conversation_id, message) = delivery::send_message(
        &state.db,
        &state.dispatcher,
        &state.notifier,
        claims.sub,
        req.receiver_id,
        req.content,
        req.media,
        req.media_type,
    )
    .await
    .map_err(|e| match e {
        SendError::MissingBody => ApiError::Validation(e.to_string()),
        SendError::UnknownReceiver => ApiError::NotFound("receiver"),
        SendError::Storage(inner) => ApiError::Internal(inner),
    })?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            conversation_id,
            message,
        }),
    ))
}

/// Thread between the caller and `other_id`, oldest first. Fetching marks
/// everything unread from the other party as read (read-on-fetch), so the
/// returned rows already reflect the flip.
pub async fn get_thread(
    State(state): State<AppState>,
    Path(other_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let self_id = claims.sub.to_string();
    let other = other_id.to_string();

    let rows = blocking(move || {
        db.mark_thread_read(&self_id, &other, &Utc::now().to_rfc3339())?;
        db.get_thread(&self_id, &other)
    })
    .await?;

    let messages: Vec<_> = rows
        .into_iter()
        .filter_map(|row| match row.into_message() {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("skipping corrupt message row: {:#}", e);
                None
            }
        })
        .collect();

    Ok(Json(messages))
}

pub async fn get_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let self_id = claims.sub.to_string();

    let rows = blocking(move || db.get_conversations(&self_id)).await?;

    let summaries: Vec<ConversationSummary> = rows
        .into_iter()
        .filter_map(|row| match summarize(row) {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("skipping corrupt conversation row: {:#}", e);
                None
            }
        })
        .collect();

    Ok(Json(summaries))
}

fn summarize(row: ConversationRow) -> anyhow::Result<ConversationSummary> {
    Ok(ConversationSummary {
        id: row.id.parse()?,
        participants: [row.participant_a.parse()?, row.participant_b.parse()?],
        last_message_id: row.last_message_id.as_deref().map(str::parse).transpose()?,
        last_message_at: row.last_message_at.as_deref().map(parse_ts).transpose()?,
        unread_count: row.unread,
    })
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let self_id = claims.sub.to_string();

    let unread = blocking(move || db.unread_total(&self_id)).await?;

    Ok(Json(UnreadCountResponse { unread }))
}

pub async fn unread_by_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let self_id = claims.sub.to_string();

    let rows = blocking(move || db.unread_by_conversation(&self_id)).await?;

    let counts: Vec<ConversationUnread> = rows
        .into_iter()
        .filter_map(|(conversation_id, sender_id, unread)| {
            match (conversation_id.parse(), sender_id.parse()) {
                (Ok(conversation_id), Ok(other_id)) => Some(ConversationUnread {
                    conversation_id,
                    other_id,
                    unread,
                }),
                _ => {
                    warn!("skipping corrupt unread row for conversation {}", conversation_id);
                    None
                }
            }
        })
        .collect();

    Ok(Json(counts))
}

/// Messages are deleted by their sender only.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let id = message_id.to_string();

    let row = blocking(move || db.get_message(&id)).await?;
    let row = row.ok_or(ApiError::NotFound("message"))?;

    if row.sender_id != claims.sub.to_string() {
        return Err(ApiError::Forbidden);
    }

    let db = state.db.clone();
    let id = message_id.to_string();
    blocking(move || db.delete_message(&id)).await?;

    Ok(StatusCode::NO_CONTENT)
}
