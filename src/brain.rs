use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::errors::{UnsubError, UnsubResult};
use crate::types::Conversation;

/// What a model call sees after the instructions.
#[derive(Debug, Clone, Copy)]
pub enum GatewayInput<'a> {
    Conversation(&'a Conversation),
    Text(&'a str),
}

impl GatewayInput<'_> {
    fn to_json(self) -> UnsubResult<Value> {
        Ok(match self {
            GatewayInput::Conversation(conversation) => serde_json::to_value(conversation)?,
            GatewayInput::Text(text) => Value::String(text.to_string()),
        })
    }
}

/// Black-box completion endpoint.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, instructions: &str, input: GatewayInput<'_>) -> UnsubResult<String>;
}

/// OpenAI Responses API client with bounded, cancellable rate-limit retry.
pub struct OpenAiGateway {
    client: Client,
    config: GatewayConfig,
    cancel: CancellationToken,
}

impl OpenAiGateway {
    pub fn new(config: GatewayConfig, cancel: CancellationToken) -> Self {
        Self {
            client: Client::new(),
            config,
            cancel,
        }
    }

    async fn wait_before_retry(&self, delay: Duration) -> UnsubResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UnsubError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiGateway {
    async fn complete(&self, instructions: &str, input: GatewayInput<'_>) -> UnsubResult<String> {
        let body = json!({
            "model": self.config.model,
            "instructions": instructions,
            "input": input.to_json()?,
        });
        let url = format!("{}/responses", self.config.api_base);
        let policy = &self.config.retry;

        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(UnsubError::Cancelled);
            }

            tracing::debug!(model = %self.config.model, attempt, "sending LLM request");
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| UnsubError::Transport(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= policy.max_retries {
                    return Err(UnsubError::RateLimited {
                        attempts: attempt + 1,
                    });
                }
                let delay = retry_after(&response)
                    .unwrap_or_else(|| jittered(policy.backoff(attempt)));
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, backing off"
                );
                self.wait_before_retry(delay).await?;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                let err_body = response.text().await.unwrap_or_default();
                return Err(UnsubError::Transport(format!("{status}: {err_body}")));
            }

            let json: Value = response
                .json()
                .await
                .map_err(|e| UnsubError::Transport(e.to_string()))?;
            let text = parse_response(&json)?;
            tracing::info!(content_len = text.len(), "LLM response received");
            return Ok(text);
        }
    }
}

/// Pulls the reply text out of a Responses API body.
pub fn parse_response(json: &Value) -> UnsubResult<String> {
    if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
        return Err(UnsubError::Transport(format!("error payload in response: {err}")));
    }

    if let Some(text) = json.get("output_text").and_then(Value::as_str) {
        return Ok(text.to_string());
    }

    let items = json["output"]
        .as_array()
        .ok_or_else(|| UnsubError::Transport(format!("no output in LLM response: {json}")))?;

    let text = items
        .iter()
        .filter(|item| item["type"] == "message")
        .filter_map(|item| item["content"].as_array())
        .flatten()
        .filter(|part| part["type"] == "output_text")
        .filter_map(|part| part["text"].as_str())
        .collect::<String>();
    Ok(text)
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    let raw = response.headers().get(reqwest::header::RETRY_AFTER)?;
    let secs: u64 = raw.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

fn jittered(delay: Duration) -> Duration {
    // up to +25%
    delay.mul_f64(1.0 + rand::random::<f64>() * 0.25)
}
