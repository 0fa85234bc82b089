//! Ollama provider, for running the risk classifier on a local model.
//!
//! Calls `POST {host}/api/chat` with `stream: false`. The system prompt
//! travels as a leading `role: "system"` message.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::LlmClient;
use super::{LlmResponse, Message};
use crate::config::ClassifierConfig;

const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Message,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

pub struct OllamaClient {
    client: Client,
    config: ClassifierConfig,
    host: String,
}

impl OllamaClient {
    pub fn new(config: ClassifierConfig) -> Self {
        let host = config
            .host
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            client: Client::new(),
            config,
            host,
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, system_prompt: &str, messages: &[Message]) -> Result<LlmResponse> {
        let mut chat = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            chat.push(Message {
                role: "system".to_string(),
                content: system_prompt.to_string(),
            });
        }
        chat.extend_from_slice(messages);

        let request = ChatRequest {
            model: &self.config.model,
            messages: chat,
            stream: false,
            options: ChatOptions {
                num_predict: self.config.max_tokens_per_request,
            },
        };

        debug!("Calling Ollama API ({}) at {}", self.config.model, self.host);

        let response = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            anyhow::bail!("Ollama API error ({status}): {body}");
        }

        let resp: ChatResponse = response.json().await?;
        Ok(LlmResponse {
            text: resp.message.content,
            input_tokens: resp.prompt_eval_count.unwrap_or(0),
            output_tokens: resp.eval_count.unwrap_or(0),
        })
    }

    fn description(&self) -> String {
        format!("ollama ({})", self.config.model)
    }
}
