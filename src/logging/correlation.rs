//! Correlation id propagation across asynchronous boundaries.
//!
//! The id lives in a task-local scope, not an OS-thread local: tokio migrates
//! tasks across worker threads, so continuations after an `.await` must still
//! see the id that was active when the request entered the core.

use std::future::Future;

use uuid::Uuid;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Generate a fresh correlation id
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Correlation id of the current task scope, if one is active
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// Run a future with the given correlation id in scope
pub async fn with_correlation<F>(correlation_id: impl Into<String>, fut: F) -> F::Output
where
    F: Future,
{
    CORRELATION_ID.scope(correlation_id.into(), fut).await
}

/// Run a future inside a freshly generated correlation scope
pub async fn correlation_scope<F>(fut: F) -> F::Output
where
    F: Future,
{
    with_correlation(new_correlation_id(), fut).await
}
