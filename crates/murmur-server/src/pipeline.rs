//! Background event processing: thread context reconstruction,
//! completion call, store writes, and reply delivery.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine;
use murmur_ai::{ChatMessage, ChatRole, CompletionClient};
use murmur_slack::Responder;
use murmur_store::{MessageRole, MessageStore, StoredMessage};

use crate::event::{classify_event, EventClassification, EventPayload, FileAttachment};
use crate::thread_locks::ThreadLocks;

const APOLOGY_TEXT: &str = "Sorry, something went wrong while generating this reply.";
const DOCUMENT_FAILURE_TEXT: &str = "Sorry, I could not analyze that PDF.";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The bot's own Slack user id; its messages never trigger replies.
    pub bot_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What one background task did with its event.
pub enum PipelineOutcome {
    Ignored(&'static str),
    Replied { placeholder_ts: String },
    DocumentAnalyzed { posted_ts: String },
}

/// Runs the deferred half of the webhook pipeline for one event.
pub struct Pipeline {
    store: Arc<dyn MessageStore>,
    completion: Arc<dyn CompletionClient>,
    responder: Responder,
    locks: ThreadLocks,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn MessageStore>,
        completion: Arc<dyn CompletionClient>,
        responder: Responder,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            completion,
            responder,
            locks: ThreadLocks::new(),
            config,
        }
    }

    pub async fn process_event(&self, event: EventPayload) -> Result<PipelineOutcome> {
        match classify_event(&event, &self.config.bot_user_id) {
            EventClassification::Ignore(reason) => {
                tracing::info!(
                    event_type = %event.event_type,
                    reason,
                    "dropping event without reply",
                );
                Ok(PipelineOutcome::Ignored(reason))
            }
            EventClassification::Mention => self.handle_conversational(&event, false).await,
            EventClassification::ThreadMessage => self.handle_conversational(&event, true).await,
            EventClassification::Document(pdf) => self.handle_document(&event, &pdf).await,
        }
    }

    /// Conversational reply path. `require_history` is set for plain
    /// `message` events: the bot only continues threads it already
    /// participates in.
    async fn handle_conversational(
        &self,
        event: &EventPayload,
        require_history: bool,
    ) -> Result<PipelineOutcome> {
        let channel = event.channel.as_deref().context("event missing channel")?;
        let ts = event.ts.as_deref().context("event missing ts")?;
        let thread_key = event.thread_ts.as_deref().unwrap_or(ts);

        let _guard = self.locks.acquire(&format!("{channel}:{thread_key}")).await;

        // History is read before the current turn is persisted so the
        // turn does not appear inside its own context window.
        let history = self
            .store
            .list_thread(thread_key)
            .await
            .context("failed to read thread history")?;
        if require_history && history.is_empty() {
            tracing::info!(channel, thread_key, "message in untracked thread, no reply");
            return Ok(PipelineOutcome::Ignored("untracked thread"));
        }

        let placeholder = self
            .responder
            .post_placeholder(channel, Some(thread_key))
            .await?;

        let mut messages = history
            .iter()
            .map(stored_to_chat_message)
            .collect::<Vec<_>>();
        messages.push(ChatMessage::user(event.text_or_empty()));

        let reply = match self.completion.generate(&messages).await {
            Ok(reply) => reply,
            Err(error) => {
                self.edit_to_apology(channel, &placeholder.ts).await;
                return Err(error).context("completion request failed");
            }
        };

        self.responder
            .update(channel, &placeholder.ts, &reply)
            .await?;

        let user_inserted = self
            .store
            .append(&StoredMessage {
                channel_id: channel.to_string(),
                ts: ts.to_string(),
                thread_ts: event.thread_ts.clone(),
                text: event.text_or_empty().to_string(),
                role: MessageRole::User,
            })
            .await
            .context("failed to persist user turn")?;
        if !user_inserted {
            tracing::warn!(channel, ts, "user turn already stored, likely event redelivery");
        }
        self.store
            .append(&StoredMessage {
                channel_id: channel.to_string(),
                ts: placeholder.ts.clone(),
                thread_ts: Some(thread_key.to_string()),
                text: reply,
                role: MessageRole::Assistant,
            })
            .await
            .context("failed to persist assistant turn")?;

        tracing::info!(channel, thread_key, placeholder_ts = %placeholder.ts, "reply delivered");
        Ok(PipelineOutcome::Replied {
            placeholder_ts: placeholder.ts,
        })
    }

    /// Document analysis path. Short-circuits the conversational path
    /// entirely; a PDF-bearing event is never also a text turn.
    async fn handle_document(
        &self,
        event: &EventPayload,
        pdf: &FileAttachment,
    ) -> Result<PipelineOutcome> {
        let channel = event.channel.as_deref().context("event missing channel")?;
        let ts = event.ts.as_deref().context("event missing ts")?;
        let thread_key = event.thread_ts.as_deref().unwrap_or(ts);

        let _guard = self.locks.acquire(&format!("{channel}:{thread_key}")).await;

        match self
            .analyze_and_record_document(event, pdf, channel, ts, thread_key)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                if let Err(post_error) = self
                    .responder
                    .client()
                    .post_message(channel, DOCUMENT_FAILURE_TEXT, Some(thread_key))
                    .await
                {
                    tracing::warn!(
                        channel,
                        thread_key,
                        error = %post_error,
                        "failed to post document failure notice",
                    );
                }
                Err(error)
            }
        }
    }

    async fn analyze_and_record_document(
        &self,
        event: &EventPayload,
        pdf: &FileAttachment,
        channel: &str,
        ts: &str,
        thread_key: &str,
    ) -> Result<PipelineOutcome> {
        let url = pdf
            .download_url()
            .context("pdf attachment has no download url")?;
        let bytes = self
            .responder
            .client()
            .download_file(url)
            .await
            .context("failed to download pdf attachment")?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

        let analysis = self
            .completion
            .analyze_document(&encoded, event.text_or_empty())
            .await
            .context("document analysis failed")?;

        self.store
            .append(&StoredMessage {
                channel_id: channel.to_string(),
                ts: ts.to_string(),
                thread_ts: event.thread_ts.clone(),
                text: format!("[shared file: {}]", pdf.display_name()),
                role: MessageRole::User,
            })
            .await
            .context("failed to persist file-share turn")?;
        // The analysis is recorded before the post, so its row carries
        // a locally assigned ts rather than Slack's.
        self.store
            .append(&StoredMessage {
                channel_id: channel.to_string(),
                ts: locally_assigned_ts(),
                thread_ts: Some(thread_key.to_string()),
                text: analysis.clone(),
                role: MessageRole::Assistant,
            })
            .await
            .context("failed to persist analysis turn")?;

        let posted = self
            .responder
            .client()
            .post_message(channel, &analysis, Some(thread_key))
            .await
            .context("failed to post document analysis")?;

        tracing::info!(channel, thread_key, posted_ts = %posted.ts, "document analysis delivered");
        Ok(PipelineOutcome::DocumentAnalyzed { posted_ts: posted.ts })
    }

    async fn edit_to_apology(&self, channel: &str, placeholder_ts: &str) {
        if let Err(error) = self
            .responder
            .update(channel, placeholder_ts, APOLOGY_TEXT)
            .await
        {
            tracing::warn!(
                channel,
                placeholder_ts,
                error = %error,
                "failed to edit placeholder into apology",
            );
        }
    }
}

fn stored_to_chat_message(message: &StoredMessage) -> ChatMessage {
    let role = match message.role {
        MessageRole::User => ChatRole::User,
        MessageRole::Assistant => ChatRole::Assistant,
    };
    ChatMessage {
        role,
        text: message.text.clone(),
    }
}

fn locally_assigned_ts() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}
