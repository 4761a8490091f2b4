//! Top-level driver for one or more tasks.

use crate::error::{PipelineError, Result};
use crate::task::{PipelineTask, TaskState};
use futures_util::future::join_all;
use tracing::{info, warn};

/// Runs tasks to completion, optionally cancelling them on Ctrl-C / SIGTERM.
#[derive(Debug, Clone, Copy)]
pub struct PipelineRunner {
    handle_sigint: bool,
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRunner {
    /// Runner that reacts to interrupt signals.
    pub fn new() -> Self {
        Self {
            handle_sigint: true,
        }
    }

    /// Whether Ctrl-C and SIGTERM cancel running tasks.
    pub fn with_handle_sigint(mut self, handle_sigint: bool) -> Self {
        self.handle_sigint = handle_sigint;
        self
    }

    /// Run `task` until it reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Propagates launch failures from [`PipelineTask::run`], and returns
    /// [`PipelineError::Fatal`] if the task panicked.
    pub async fn run(&self, task: PipelineTask) -> Result<TaskState> {
        let handle = task.handle();
        let id = handle.id().to_owned();
        let mut running = tokio::spawn(task.run());

        let joined = if self.handle_sigint {
            tokio::select! {
                joined = &mut running => joined,
                () = shutdown_signal() => {
                    info!(task = %id, "received shutdown signal, cancelling");
                    handle.cancel().await;
                    running.await
                }
            }
        } else {
            running.await
        };

        joined.map_err(|e| {
            warn!(task = %id, "task panicked: {e}");
            PipelineError::fatal("runner", e.to_string())
        })?
    }

    /// Run several tasks concurrently; results come back in input order.
    pub async fn run_all(&self, tasks: Vec<PipelineTask>) -> Vec<Result<TaskState>> {
        join_all(tasks.into_iter().map(|task| self.run(task))).await
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
