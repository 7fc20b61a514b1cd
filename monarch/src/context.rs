use crate::error::Error;
use postgres::{CancelToken, NoTls};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Pause between two cancel requests sent for a stopped run.
const CANCEL_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Cancellation and deadline for a single migration run.
///
/// Every database call made by the migrator and by the `db` API checks the
/// context first, running scripts poll it from an instruction hook, and a
/// statement already executing on the server is cancelled when the run
/// stops. Clones share the cancellation token, so a clone handed to another
/// thread can stop the run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the run once `timeout` has elapsed from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns an error if the run was cancelled or its deadline has passed.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Cancel whatever statement the connection behind `cancel_token` is
    /// running once this run stops. Watching ends when the guard is dropped.
    pub(crate) fn watch(&self, cancel_token: CancelToken) -> Result<QueryWatch, Error> {
        let finished = CancellationToken::new();
        let ctx = self.clone();
        let done = finished.clone();
        let handle = thread::Builder::new()
            .name("monarch-cancel".to_string())
            .spawn(move || ctx.cancel_when_stopped(&done, &cancel_token))?;

        Ok(QueryWatch {
            finished,
            handle: Some(handle),
        })
    }

    fn cancel_when_stopped(&self, finished: &CancellationToken, cancel_token: &CancelToken) {
        if !self.wait_for_stop(finished) {
            return;
        }

        tracing::debug!("run stopped, cancelling running statement");
        // a request sent between two statements is ignored by the server
        while !finished.is_cancelled() {
            if let Err(err) = cancel_token.cancel_query(NoTls) {
                tracing::warn!(error = %err, "failed to cancel running statement");
                return;
            }
            thread::sleep(CANCEL_RETRY_INTERVAL);
        }
    }

    /// True once the run is cancelled or past its deadline, false if
    /// `finished` fires first.
    fn wait_for_stop(&self, finished: &CancellationToken) -> bool {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::warn!(error = %err, "cannot watch run for cancellation");
                return false;
            }
        };

        let deadline = self.deadline;
        runtime.block_on(async {
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = finished.cancelled() => false,
                _ = self.token.cancelled() => true,
                _ = expired => true,
            }
        })
    }
}

/// Keeps a [`RunContext::watch`] alive.
pub(crate) struct QueryWatch {
    finished: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Drop for QueryWatch {
    fn drop(&mut self) {
        self.finished.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
