//! Shutdown coordination for the controller's background tasks.
//!
//! Every task is spawned under a name so that shutdown can report which one
//! panicked or is still running when the timeout expires. Tasks observe the
//! shutdown broadcast through [`ShutdownManager::subscribe`]; the signal is
//! delivered by dropping the sender, so `changed()` resolves with an error.

use futures::FutureExt;
use std::{any::Any, future::Future, panic::AssertUnwindSafe, time::Duration};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("background task `{name}` panicked: {message}")]
    Panic { name: &'static str, message: String },
    #[error("background task could not be joined")]
    Join(#[from] JoinError),
    #[error("shutdown timed out after {timeout:?}; still running: {pending:?}")]
    Timeout { timeout: Duration, pending: Vec<&'static str> },
}

type TaskOutcome = (&'static str, Result<(), String>);

pub struct ShutdownManager {
    tasks: JoinSet<TaskOutcome>,
    names: Vec<&'static str>,
    shutdown_tx: watch::Sender<()>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(());
        Self { tasks: JoinSet::new(), names: Vec::new(), shutdown_tx }
    }

    /// Spawns `task` under `name`. Dropping the manager aborts it.
    pub fn spawn_task<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(async move {
            let outcome = AssertUnwindSafe(task).catch_unwind().await.map_err(panic_message);
            (name, outcome)
        });
        self.names.push(name);
        debug!(task = name, "Spawned background task");
    }

    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Aborts every task without waiting for it.
    pub fn abort_all(&mut self) {
        warn!(tasks = self.tasks.len(), "Aborting background tasks");
        self.tasks.abort_all();
    }

    /// Broadcasts shutdown and waits up to `timeout` for every task to
    /// finish. The first panic is returned; the remaining tasks are aborted
    /// on timeout.
    pub async fn graceful_shutdown(self, timeout: Duration) -> Result<(), ShutdownError> {
        let ShutdownManager { mut tasks, names: mut pending, shutdown_tx } = self;

        info!(tasks = tasks.len(), "Broadcasting shutdown signal");
        drop(shutdown_tx);

        let join_all = async {
            while let Some(res) = tasks.join_next().await {
                let (name, outcome) = res?;
                if let Some(pos) = pending.iter().position(|n| *n == name) {
                    pending.remove(pos);
                }
                match outcome {
                    Ok(()) => debug!(task = name, "Background task finished"),
                    Err(message) => return Err(ShutdownError::Panic { name, message }),
                }
            }
            Ok(())
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(Ok(())) => {
                info!("All background tasks completed");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Background task failed during shutdown");
                Err(e)
            }
            Err(_) => {
                error!(?timeout, ?pending, "Shutdown timed out, aborting remaining tasks");
                tasks.abort_all();
                Err(ShutdownError::Timeout { timeout, pending })
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
