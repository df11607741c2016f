//! Reply delivery: placeholder post plus update with bounded retry.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;

use crate::api_client::{SlackApiClient, SlackPostedMessage};

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Additional attempts after the first update failure.
    pub max_update_retries: usize,
    /// Fixed delay between update attempts.
    pub retry_delay_ms: u64,
    /// Text posted while the reply is being generated.
    pub placeholder_text: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            max_update_retries: 3,
            retry_delay_ms: 1_000,
            placeholder_text: "Generating a reply...".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
/// Posts the interim placeholder and later replaces it with the final
/// reply text, retrying the replacement a bounded number of times.
pub struct Responder {
    client: SlackApiClient,
    config: ResponderConfig,
}

impl Responder {
    pub fn new(client: SlackApiClient, config: ResponderConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &SlackApiClient {
        &self.client
    }

    /// Posts the placeholder into the target thread. Not retried: with
    /// no message to update there is nothing to recover into.
    pub async fn post_placeholder(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
    ) -> Result<SlackPostedMessage> {
        self.client
            .post_message(channel, &self.config.placeholder_text, thread_ts)
            .await
            .context("failed to post placeholder reply")
    }

    /// Replaces a posted message's text, retrying with a fixed delay.
    /// After `max_update_retries` additional failures the error is
    /// terminal for this reply.
    pub async fn update(&self, channel: &str, ts: &str, text: &str) -> Result<()> {
        let mut attempt = 0usize;
        loop {
            match self.client.update_message(channel, ts, text, attempt).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    if attempt >= self.config.max_update_retries {
                        return Err(error).with_context(|| {
                            format!(
                                "reply update failed after {} retries",
                                self.config.max_update_retries
                            )
                        });
                    }
                    attempt += 1;
                    sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }
}
