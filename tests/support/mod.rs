//! Shared test fixtures: a scripted provider adapter so orchestrator tests can drive
//! deterministic `LLMResponse`s without a network call.

use std::collections::VecDeque;
use std::sync::Arc;

use agent_world::agent_world::provider::{ChunkCallback, LLMResponse, ProviderAdapter, ToolSchema};
use agent_world::{AgentMessage, WorldError};
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Returns a fixed queue of responses, one per call to `complete`, in order. Panics if
/// exhausted — a test that needs more turns than it scripted has a bug, not the adapter.
pub struct MockProviderAdapter {
    queue: Mutex<VecDeque<LLMResponse>>,
    model: String,
}

impl MockProviderAdapter {
    pub fn new(responses: Vec<LLMResponse>) -> Arc<Self> {
        Arc::new(MockProviderAdapter {
            queue: Mutex::new(responses.into_iter().collect()),
            model: "mock-model".to_string(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for MockProviderAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        _messages: &[AgentMessage],
        _tools: &[ToolSchema],
        on_chunk: Option<&ChunkCallback<'_>>,
    ) -> Result<LLMResponse, WorldError> {
        let response = self
            .queue
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| WorldError::Provider("mock provider exhausted its scripted responses".to_string()))?;
        if let Some(chunk_cb) = on_chunk {
            let text = match &response {
                LLMResponse::Text { content, .. } => content.as_str(),
                LLMResponse::ToolCalls { content, .. } => content.as_str(),
            };
            chunk_cb(text);
        }
        Ok(response)
    }
}
