//! Ambient client lookup
//!
//! Compatibility shim for code that cannot thread a client through its
//! call chain. Prefer passing `Arc<Client<_>>` explicitly; this only
//! attaches one to the current task for the duration of a future.

use crate::client::Client;
use crate::source::UpdateSource;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT_CLIENT: Arc<dyn Any + Send + Sync>;
}

/// Run `future` with `client` retrievable through [`current`].
pub async fn scope<S, F>(client: Arc<Client<S>>, future: F) -> F::Output
where
    S: UpdateSource,
    F: Future,
{
    CURRENT_CLIENT.scope(client, future).await
}

/// The client attached by the innermost enclosing [`scope`].
///
/// `None` outside any scope, or when the attached client watches through
/// a different source type.
#[must_use]
pub fn current<S: UpdateSource>() -> Option<Arc<Client<S>>> {
    CURRENT_CLIENT
        .try_with(Arc::clone)
        .ok()
        .and_then(|client| client.downcast::<Client<S>>().ok())
}
