//! Inbound webhook payload shapes and event classification.

use serde::Deserialize;

const PDF_MIMETYPE: &str = "application/pdf";

#[derive(Debug, Clone, Deserialize)]
/// Top-level Slack Events API payload.
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub payload_type: String,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event: Option<EventPayload>,
}

#[derive(Debug, Clone, Deserialize)]
/// The inner event of an `event_callback` payload.
pub struct EventPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
}

impl EventPayload {
    /// Thread key: the thread root's ts, or the event's own ts for a
    /// message that starts a new thread.
    pub fn thread_key(&self) -> Option<&str> {
        self.thread_ts.as_deref().or(self.ts.as_deref())
    }

    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileAttachment {
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url_private: Option<String>,
    #[serde(default)]
    pub url_private_download: Option<String>,
}

impl FileAttachment {
    pub fn is_pdf(&self) -> bool {
        self.mimetype.as_deref() == Some(PDF_MIMETYPE)
    }

    pub fn download_url(&self) -> Option<&str> {
        self.url_private_download
            .as_deref()
            .or(self.url_private.as_deref())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed file")
    }
}

#[derive(Debug, Clone)]
/// Request-scoped identifiers carried through logging explicitly
/// instead of living in ambient globals.
pub struct EventContext {
    pub event_id: String,
    pub channel: String,
    pub thread_key: String,
}

impl EventContext {
    pub fn from_event(event_id: Option<&str>, event: &EventPayload) -> Self {
        Self {
            event_id: event_id.unwrap_or("unknown").to_string(),
            channel: event.channel.clone().unwrap_or_default(),
            thread_key: event.thread_key().unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Where an event callback is routed within the background task.
pub enum EventClassification {
    /// No reply, no side effects. Carries the drop reason for logging.
    Ignore(&'static str),
    /// `app_mention`: always answered.
    Mention,
    /// Plain `message`: answered only if the thread is already tracked.
    ThreadMessage,
    /// Message carrying a PDF attachment: diverted to document analysis.
    Document(FileAttachment),
}

/// Classifies an event callback before any store access.
///
/// The bot's own messages are dropped first so a posted reply can never
/// re-trigger the pipeline. A plain `message` whose text mentions the
/// bot is still a `ThreadMessage`: Slack emits a separate `app_mention`
/// event for real mentions, and promoting the twin would answer the
/// same turn twice.
pub fn classify_event(event: &EventPayload, bot_user_id: &str) -> EventClassification {
    if event.subtype.as_deref() == Some("bot_message") {
        return EventClassification::Ignore("bot_message subtype");
    }
    match event.user.as_deref() {
        Some(user) if user == bot_user_id => {
            return EventClassification::Ignore("own bot message");
        }
        Some(_) => {}
        None => return EventClassification::Ignore("missing author"),
    }
    if event.channel.is_none() || event.ts.is_none() {
        return EventClassification::Ignore("missing channel or ts");
    }

    if let Some(pdf) = event.files.iter().find(|file| file.is_pdf()) {
        return EventClassification::Document(pdf.clone());
    }

    match event.event_type.as_str() {
        "app_mention" => EventClassification::Mention,
        "message" if event.subtype.is_none() => EventClassification::ThreadMessage,
        _ => EventClassification::Ignore("unhandled event subtype"),
    }
}
