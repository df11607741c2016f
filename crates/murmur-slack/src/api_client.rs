//! Slack Web API client used for posting, updating, and file download.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
struct SlackChatMessageResponse {
    ok: bool,
    ts: Option<String>,
    channel: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
/// Identifier of a message the bot has posted.
pub struct SlackPostedMessage {
    pub channel: String,
    pub ts: String,
}

#[derive(Debug, Clone)]
pub struct SlackApiClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl SlackApiClient {
    pub fn new(api_base: String, bot_token: String, request_timeout_ms: u64) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("murmur-slack"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create slack api client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.trim().to_string(),
        })
    }

    pub async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<SlackPostedMessage> {
        let mut payload = json!({
            "channel": channel,
            "text": text,
        });
        if let Some(thread_ts) = thread_ts {
            payload["thread_ts"] = Value::String(thread_ts.to_string());
        }

        let response = self
            .call_chat_api("chat.postMessage", &payload)
            .await?;
        if !response.ok {
            bail!(
                "slack chat.postMessage failed: {}",
                response
                    .error
                    .unwrap_or_else(|| "unknown error".to_string())
            );
        }

        Ok(SlackPostedMessage {
            channel: response.channel.unwrap_or_else(|| channel.to_string()),
            ts: response
                .ts
                .ok_or_else(|| anyhow!("slack chat.postMessage response missing ts"))?,
        })
    }

    pub async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
        attempt: usize,
    ) -> Result<()> {
        let payload = json!({
            "channel": channel,
            "ts": ts,
            "text": text,
        });

        let response = self
            .call_chat_api_with_attempt("chat.update", &payload, attempt)
            .await?;
        if !response.ok {
            bail!(
                "slack chat.update failed: {}",
                response
                    .error
                    .unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Ok(())
    }

    /// Downloads a private file through Slack's authenticated endpoint.
    pub async fn download_file(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.bot_token)
            .send()
            .await
            .context("slack file download request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("slack file download failed with status {}", status.as_u16());
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn call_chat_api(
        &self,
        operation: &str,
        payload: &Value,
    ) -> Result<SlackChatMessageResponse> {
        self.call_chat_api_with_attempt(operation, payload, 0).await
    }

    async fn call_chat_api_with_attempt(
        &self,
        operation: &str,
        payload: &Value,
        attempt: usize,
    ) -> Result<SlackChatMessageResponse> {
        let response = self
            .http
            .post(format!("{}/{}", self.api_base, operation))
            .bearer_auth(&self.bot_token)
            .header("x-murmur-retry-attempt", attempt.to_string())
            .json(payload)
            .send()
            .await
            .with_context(|| format!("slack api {operation} request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "slack api {operation} failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 800)
            );
        }

        response
            .json::<SlackChatMessageResponse>()
            .await
            .with_context(|| format!("failed to decode slack {operation} response"))
    }
}

fn truncate_for_error(body: &str, limit: usize) -> &str {
    match body.char_indices().nth(limit) {
        Some((index, _)) => &body[..index],
        None => body,
    }
}
