//! `LlmClient` trait, the seam between the risk classifier and a model
//! backend selected by `[security.classifier] provider`.

use anyhow::Result;
use async_trait::async_trait;

use super::{LlmResponse, Message};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends a conversation to the LLM and returns the response.
    async fn complete(&self, system_prompt: &str, messages: &[Message]) -> Result<LlmResponse>;

    /// Provider and model, e.g. `"anthropic (claude-haiku-4-5)"`.
    fn description(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_client_is_object_safe() {
        fn _assert_object_safe(_: &dyn LlmClient) {}
    }
}
