//! Scoped cleanup list
//!
//! Each step that allocates journal or cluster state pushes a compensating
//! action. On terminal failure the actions run newest first; on success (or a
//! retryable outcome that must keep its state) the list is committed and
//! nothing runs. Failures while unwinding are logged and swallowed so they
//! never mask the error that caused the unwind.

use crate::error::Result;
use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, warn};

/// Pending compensating actions, run in reverse push order
#[must_use = "a rollback list must be either run or committed"]
pub struct Rollback {
    steps: Vec<(String, BoxFuture<'static, Result<()>>)>,
}

impl Rollback {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Register a compensating action; it does not run until [`Rollback::run`]
    pub fn push<F>(&mut self, description: impl Into<String>, step: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push((description.into(), Box::pin(step)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keep everything that was allocated
    pub fn commit(self) {
        debug!("Committed {} rollback steps", self.steps.len());
    }

    /// Commit on success or when a clone is still materializing, undo otherwise
    pub async fn settle<T>(self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.commit(),
            Err(e) if e.is_clone_in_progress() => self.commit(),
            Err(_) => self.run().await,
        }
        result
    }

    /// Undo every registered step, newest first
    pub async fn run(self) {
        for (description, step) in self.steps.into_iter().rev() {
            match step.await {
                Ok(()) => debug!("Rolled back: {}", description),
                Err(e) => warn!("Rollback step failed ({}): {}", description, e),
            }
        }
    }
}

impl Default for Rollback {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str, bool) -> BoxFuture<'static, Result<()>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = log.clone();
        let step = move |name: &'static str, fail: bool| -> BoxFuture<'static, Result<()>> {
            let log = handle.clone();
            Box::pin(async move {
                log.lock().push(name);
                if fail {
                    Err(Error::Internal(format!("{} failed", name)))
                } else {
                    Ok(())
                }
            })
        };
        (log, step)
    }

    #[tokio::test]
    async fn test_runs_in_reverse_order() {
        let (log, step) = recorder();
        let mut rollback = Rollback::new();
        rollback.push("first", step("first", false));
        rollback.push("second", step("second", false));
        rollback.push("third", step("third", false));
        assert_eq!(rollback.len(), 3);

        rollback.run().await;
        assert_eq!(*log.lock(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_unwinding() {
        let (log, step) = recorder();
        let mut rollback = Rollback::new();
        rollback.push("first", step("first", false));
        rollback.push("second", step("second", true));

        rollback.run().await;
        assert_eq!(*log.lock(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_settle_keeps_state_for_clone_in_progress() {
        let (log, step) = recorder();
        let mut rollback = Rollback::new();
        rollback.push("first", step("first", false));
        let result: Result<()> = rollback
            .settle(Err(Error::CloneInProgress {
                volume_id: "v".into(),
            }))
            .await;
        assert!(result.unwrap_err().is_clone_in_progress());
        assert!(log.lock().is_empty());

        let mut rollback = Rollback::new();
        rollback.push("second", step("second", false));
        let result: Result<()> = rollback.settle(Err(Error::Internal("boom".into()))).await;
        assert!(result.is_err());
        assert_eq!(*log.lock(), vec!["second"]);
    }

    #[tokio::test]
    async fn test_commit_runs_nothing() {
        let (log, step) = recorder();
        let mut rollback = Rollback::new();
        rollback.push("first", step("first", false));

        rollback.commit();
        tokio::task::yield_now().await;
        assert!(log.lock().is_empty());
    }
}
