//! Supervised background tasks with observable outcomes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::event::EventContext;

#[derive(Debug, Default)]
/// Tracks every deferred event task so failures are counted and logged
/// instead of vanishing inside a detached closure.
pub struct TaskSupervisor {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits one background task for an acknowledged event. Errors
    /// are terminal for that event only: they are logged with the
    /// event context and never reach the already-sent HTTP response.
    pub fn spawn<F>(self: &Arc<Self>, context: EventContext, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            match task.await {
                Ok(()) => {
                    supervisor.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    supervisor.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        event_id = %context.event_id,
                        channel = %context.channel,
                        thread_key = %context.thread_key,
                        error = %format!("{error:#}"),
                        "background event processing failed",
                    );
                }
            }
        })
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
