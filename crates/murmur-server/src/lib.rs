//! Webhook server and event dispatch pipeline for Murmur.
//!
//! The dispatcher verifies each inbound Slack webhook, answers setup
//! challenges inline, acknowledges event callbacks immediately, and
//! hands the remaining work (thread lookup, completion call, store
//! writes, reply update) to a supervised background task.

mod event;
mod pipeline;
mod server;
mod supervisor;
mod thread_locks;

pub use event::{
    classify_event, EventClassification, EventContext, EventPayload, FileAttachment,
    WebhookPayload,
};
pub use pipeline::{Pipeline, PipelineConfig, PipelineOutcome};
pub use server::{build_webhook_router, current_unix_timestamp, run_webhook_server, AppState};
pub use supervisor::{SupervisorSnapshot, TaskSupervisor};
pub use thread_locks::{ThreadLockGuard, ThreadLocks};

#[cfg(test)]
mod tests;
