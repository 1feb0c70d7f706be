use std::{future::Future, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {}", humantime::format_duration(*.0))]
    Elapsed(Duration),
    #[error("operation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs `op` on its own task and waits at most `limit` for it.
///
/// The operation is not cancelled when the deadline passes. If it finishes later,
/// its output is handed to `on_late` so resources it produced can be released.
pub async fn bounded<T, Op, Late, LateFut>(
    limit: Duration,
    op: Op,
    on_late: Late,
) -> Result<T, WaitError>
where
    T: Send + 'static,
    Op: Future<Output = T> + Send + 'static,
    Late: FnOnce(T) -> LateFut + Send + 'static,
    LateFut: Future<Output = ()> + Send + 'static,
{
    let mut task = tokio::spawn(op);

    tokio::select! {
        res = &mut task => Ok(res?),
        _ = tokio::time::sleep(limit) => {
            tokio::spawn(async move {
                if let Ok(out) = task.await {
                    on_late(out).await;
                }
            });
            Err(WaitError::Elapsed(limit))
        }
    }
}
