use std::future::Future;

use anyhow::{anyhow, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Long-running tasks that live and die together.
///
/// The first task to return, successfully or not, cancels the shared token
/// so the others wind down. [`TaskGroup::wait`] reports the first error.
pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: JoinSet<(&'static str, Result<()>)>,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: JoinSet::new(),
        }
    }

    /// Token every member should stop on.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Waits for every member to exit.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_err = None;

        while let Some(joined) = self.tasks.join_next().await {
            self.cancel.cancel();

            let (name, result) = match joined {
                Ok(done) => done,
                Err(e) => ("unknown", Err(anyhow!("task aborted: {e}"))),
            };

            match result {
                Ok(()) => debug!(task = name, "task exited"),
                Err(e) => {
                    error!(task = name, error = %e, "task failed");
                    if first_err.is_none() {
                        first_err = Some(e.context(format!("task {name} failed")));
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
