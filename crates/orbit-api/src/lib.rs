pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod notifications;

use error::ApiError;

/// Run a blocking rusqlite closure off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("spawn_blocking join error: {e}")))?
        .map_err(ApiError::Internal)
}
