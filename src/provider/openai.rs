//! OpenAI-compatible chat completions over `reqwest`.
//!
//! Uses the function-calling request shape (`functions`, `function_call`) so that chat turns
//! serialize as-is, and streamed deltas merge straight into a [`StreamCollector`].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CompletionService, ServiceError};
use crate::chat::{Chat, FunctionSchema};
use crate::config::CompletionConfig;
use crate::error::Result;
use crate::stream::StreamCollector;

const SERVICE: &str = "completion";

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Chat],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    functions: &'a [FunctionSchema],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Chat,
}

impl OpenAiClient {
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| service_error(None, e))?;

        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            message.truncate(512);
            return Err(anyhow::Error::new(ServiceError {
                service: SERVICE,
                status: Some(status.as_u16()),
                message,
            })
            .into());
        }
        Ok(response)
    }
}

fn service_error(status: Option<u16>, err: impl std::fmt::Display) -> crate::error::Error {
    anyhow::Error::new(ServiceError {
        service: SERVICE,
        status,
        message: err.to_string(),
    })
    .into()
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn complete(&self, messages: &[Chat], functions: &[FunctionSchema]) -> Result<Chat> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            functions,
            stream: false,
        };
        let response: ChatResponse = self
            .send(&body)
            .await?
            .json()
            .await
            .map_err(|e| service_error(None, e))?;
        let chat = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| service_error(Some(200), "response had no choices"))?;
        tracing::debug!(model = %self.model, tokens = crate::tokens::count_chat(&chat), "completion received");
        Ok(chat)
    }

    async fn stream(
        &self,
        messages: &[Chat],
        functions: &[FunctionSchema],
        stream: &mut StreamCollector,
    ) -> Result<Chat> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            functions,
            stream: true,
        };
        let mut bytes = self.send(&body).await?.bytes_stream();
        let mut buffer = LineBuffer::default();

        'events: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| service_error(None, e))?;
            buffer.extend(&chunk);

            while let Some(raw) = buffer.next_line() {
                let Ok(line) = std::str::from_utf8(&raw) else {
                    tracing::warn!(bytes = raw.len(), "skipping stream line with invalid UTF-8");
                    continue;
                };
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    break 'events;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    tracing::debug!(data, "skipping unparsable stream event");
                    continue;
                };
                if let Some(delta) = delta_of(event) {
                    stream.chunk(delta).await?;
                }
            }
        }
        stream.chat()
    }
}

/// Raw SSE bytes, handed out as complete undecoded lines. A multi-byte character may span
/// network chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// The next line including its `\n`, or `None` until one is complete.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.bytes.iter().position(|&b| b == b'\n')?;
        Some(self.bytes.drain(..=pos).collect())
    }
}

/// The first choice's delta without null fields, or `None` if it carries nothing.
fn delta_of(mut event: Value) -> Option<Value> {
    let delta = event.pointer_mut("/choices/0/delta")?.take();
    match delta {
        Value::Object(mut fields) => {
            fields.retain(|_, v| !v.is_null());
            (!fields.is_empty()).then_some(Value::Object(fields))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_strips_nulls() {
        let event = json!({"choices": [{"delta": {"content": "hi", "function_call": null}}]});
        assert_eq!(delta_of(event), Some(json!({"content": "hi"})));
        assert_eq!(delta_of(json!({"choices": [{"delta": {}}]})), None);
        assert_eq!(delta_of(json!({"choices": []})), None);
    }

    #[test]
    fn split_multibyte_character_survives_line_buffering() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut buffer = LineBuffer::default();
        buffer.extend(&line[..split]);
        assert!(buffer.next_line().is_none());
        buffer.extend(&line[split..]);
        buffer.extend(b"data: [DONE]\n");

        let first = buffer.next_line().unwrap();
        let text = std::str::from_utf8(&first).unwrap();
        let data = text.trim().strip_prefix("data:").unwrap().trim();
        let delta = delta_of(serde_json::from_str(data).unwrap()).unwrap();
        assert_eq!(delta, json!({"content": "café"}));

        assert_eq!(buffer.next_line().unwrap(), b"data: [DONE]\n".to_vec());
        assert!(buffer.next_line().is_none());
    }

    #[test]
    fn request_shape() {
        let messages = vec![Chat::system("be brief"), Chat::function("find", "[]")];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            functions: &[],
            stream: false,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][1]["role"], "function");
        assert_eq!(value["messages"][1]["name"], "find");
        assert!(value.get("functions").is_none());
    }

    #[test]
    fn response_message_parses_function_call() {
        let raw = json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "function_call": {"name": "find_memory", "arguments": "{\"question\":\"x\"}"}
            }}]
        });
        let response: ChatResponse = serde_json::from_value(raw).unwrap();
        let chat = &response.choices[0].message;
        assert_eq!(chat.action(), Some("find_memory"));
        assert_eq!(chat.content(), "");
    }
}
