use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::{
    retry::{is_retryable_http_error, next_backoff_ms, should_retry_status},
    ChatMessage, CompletionClient, MurmurAiError,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_DOCUMENT_INSTRUCTION: &str = "Summarize the content of this PDF document.";

#[derive(Debug, Clone)]
/// Connection settings for the Anthropic Messages API.
pub struct AnthropicConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
}

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> Result<Self, MurmurAiError> {
        if config.api_key.trim().is_empty() {
            return Err(MurmurAiError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(config.api_key.trim())
                .map_err(|e| MurmurAiError::InvalidResponse(format!("invalid API key header: {e}")))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }

    fn messages_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/messages") {
            return base.to_string();
        }

        format!("{base}/messages")
    }

    async fn execute_messages_request(&self, body: Value) -> Result<String, MurmurAiError> {
        let url = self.messages_url();
        let max_retries = self.config.max_retries;

        for attempt in 0..=max_retries {
            let response = self
                .client
                .post(&url)
                .header("x-murmur-retry-attempt", attempt.to_string())
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    let raw = response.text().await?;
                    if status.is_success() {
                        return parse_reply_text(&raw);
                    }

                    if attempt < max_retries && should_retry_status(status.as_u16()) {
                        sleep(std::time::Duration::from_millis(next_backoff_ms(attempt))).await;
                        continue;
                    }

                    return Err(MurmurAiError::HttpStatus {
                        status: status.as_u16(),
                        body: raw,
                    });
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_http_error(&error) {
                        sleep(std::time::Duration::from_millis(next_backoff_ms(attempt))).await;
                        continue;
                    }
                    return Err(MurmurAiError::Http(error));
                }
            }
        }

        Err(MurmurAiError::InvalidResponse(
            "request retry loop terminated unexpectedly".to_string(),
        ))
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, MurmurAiError> {
        let body = build_generate_body(&self.config.model, self.config.max_tokens, messages);
        self.execute_messages_request(body).await
    }

    async fn analyze_document(
        &self,
        pdf_base64: &str,
        instruction: &str,
    ) -> Result<String, MurmurAiError> {
        if pdf_base64.trim().is_empty() {
            return Err(MurmurAiError::InvalidResponse(
                "document payload is empty".to_string(),
            ));
        }
        let body = build_document_body(
            &self.config.model,
            self.config.max_tokens,
            pdf_base64,
            instruction,
        );
        self.execute_messages_request(body).await
    }
}

fn build_generate_body(model: &str, max_tokens: u32, messages: &[ChatMessage]) -> Value {
    let entries = messages
        .iter()
        .filter(|message| !message.text.trim().is_empty())
        .map(|message| {
            json!({
                "role": message.role.as_str(),
                "content": message.text,
            })
        })
        .collect::<Vec<_>>();

    json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": entries,
    })
}

fn build_document_body(model: &str, max_tokens: u32, pdf_base64: &str, instruction: &str) -> Value {
    let instruction = if instruction.trim().is_empty() {
        DEFAULT_DOCUMENT_INSTRUCTION
    } else {
        instruction
    };

    json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": [{
            "role": "user",
            "content": [
                {
                    "type": "document",
                    "source": {
                        "type": "base64",
                        "media_type": "application/pdf",
                        "data": pdf_base64,
                    },
                },
                {
                    "type": "text",
                    "text": instruction,
                },
            ],
        }],
    })
}

fn parse_reply_text(raw: &str) -> Result<String, MurmurAiError> {
    let parsed: AnthropicMessageResponse = serde_json::from_str(raw)?;

    parsed
        .content
        .into_iter()
        .find_map(|block| match block {
            AnthropicContent::Text { text } => Some(text),
            AnthropicContent::Other => None,
        })
        .ok_or_else(|| {
            MurmurAiError::InvalidResponse("response contained no text content block".to_string())
        })
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}
