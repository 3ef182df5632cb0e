use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::warn;
use uuid::Uuid;

use orbit_types::api::{Claims, NotificationQuery, NotificationResponse, UnreadCountResponse};

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let recipient = claims.sub.to_string();
    let limit = query.limit.min(100);

    let rows =
        blocking(move || db.list_notifications(&recipient, query.unread, limit, query.skip)).await?;

    let notifications: Vec<NotificationResponse> = rows
        .into_iter()
        .filter_map(|row| match row.into_notification() {
            Ok(n) => Some(NotificationResponse {
                id: n.id,
                sender_id: n.sender_id,
                kind: n.kind,
                content: n.content,
                related: n.related,
                is_read: n.is_read,
                created_at: n.created_at,
            }),
            Err(e) => {
                warn!("skipping corrupt notification row: {:#}", e);
                None
            }
        })
        .collect();

    Ok(Json(notifications))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let recipient = claims.sub.to_string();

    let unread = blocking(move || db.notification_unread_count(&recipient)).await?;

    Ok(Json(UnreadCountResponse { unread }))
}

/// Every mutation below checks the caller owns the notification first:
/// missing row is 404, someone else's row is 403.
async fn guard_owner(state: &AppState, id: Uuid, caller: Uuid) -> Result<(), ApiError> {
    let db = state.db.clone();
    let key = id.to_string();

    let row = blocking(move || db.get_notification(&key)).await?;
    let row = row.ok_or(ApiError::NotFound("notification"))?;

    if row.recipient_id != caller.to_string() {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    guard_owner(&state, id, claims.sub).await?;

    let db = state.db.clone();
    let key = id.to_string();
    blocking(move || db.mark_notification_read(&key)).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let recipient = claims.sub.to_string();

    let updated = blocking(move || db.mark_all_notifications_read(&recipient)).await?;

    Ok(Json(serde_json::json!({ "updated": updated })))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    guard_owner(&state, id, claims.sub).await?;

    let db = state.db.clone();
    let key = id.to_string();
    blocking(move || db.delete_notification(&key)).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_all(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let recipient = claims.sub.to_string();

    let deleted = blocking(move || db.clear_notifications(&recipient)).await?;

    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
