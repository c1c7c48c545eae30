//! Runs filesystem, tar and digest work off the async runtime

use strata_core::{Error, Result};

/// Run `work` on tokio's blocking pool; a join failure (panic or
/// cancellation) becomes [`Error::Internal`]
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("blocking task join error: {}", e)))?
}
