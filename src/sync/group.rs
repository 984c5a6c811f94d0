use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{AcquireError, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{SyncError, SyncResult};

/// Race a fallible future against cancellation of `token`.
pub(crate) async fn cancellable<T, E, F>(token: &CancellationToken, fut: F) -> SyncResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SyncError>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SyncError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}

/// A group of tasks sharing one cancellation token.
///
/// The first task to fail records its error and cancels the group's token, so that siblings
/// stop issuing new work. [`ErrorGroup::wait`] joins every task and returns that first error;
/// errors reported afterwards (usually `Cancelled` from the siblings) are dropped.
pub(crate) struct ErrorGroup {
    tasks: JoinSet<()>,
    token: CancellationToken,
    limit: Option<Arc<Semaphore>>,
    first_error: Arc<Mutex<Option<SyncError>>>,
}

impl ErrorGroup {
    // Cancelling the parent cancels the group, but not the other way around
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            token: parent.child_token(),
            limit: None,
            first_error: Default::default(),
        }
    }

    // Bound the number of tasks running at once; `spawn` waits for a free slot
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Start a task in the group, waiting for a free slot first if the group is bounded.
    ///
    /// Fails with `Cancelled` without spawning anything once the group has been cancelled.
    pub async fn spawn<F>(&mut self, task: F) -> SyncResult<()>
    where
        F: Future<Output = SyncResult<()>> + Send + 'static,
    {
        let permit = match &self.limit {
            Some(semaphore) => Some(
                cancellable(&self.token, semaphore.clone().acquire_owned()).await?,
            ),
            None if self.token.is_cancelled() => return Err(SyncError::Cancelled),
            None => None,
        };

        let token = self.token.clone();
        let first_error = self.first_error.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            if let Err(err) = task.await {
                record(&first_error, &token, err);
            }
        });
        Ok(())
    }

    /// Wait for all tasks to finish and return the first error, if any.
    pub async fn wait(mut self) -> SyncResult<()> {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                record(
                    &self.first_error,
                    &self.token,
                    SyncError::TaskFailed {
                        reason: err.to_string(),
                    },
                );
            }
        }

        match self.first_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn record(
    first_error: &Mutex<Option<SyncError>>,
    token: &CancellationToken,
    err: SyncError,
) {
    first_error.lock().get_or_insert(err);
    token.cancel();
}

// The semaphore is never closed, so failing to acquire only happens on shutdown
impl From<AcquireError> for SyncError {
    fn from(_: AcquireError) -> Self {
        SyncError::Cancelled
    }
}
