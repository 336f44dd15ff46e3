//! Provider adapters: the one external collaborator the orchestrator actually calls.
//!
//! Contract (§4.9): a provider is a *pure* client. Input is the prepared message sequence
//! plus tool schemas; output is a typed `LLMResponse`. A provider MUST NOT execute tools,
//! consult the approval checker, touch storage, or emit bus events other than streamed
//! chunks via the supplied `on_chunk` callback. Keeping providers pure is what lets the
//! orchestrator reason about the tool loop without caring which backend answered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use tokio::sync::Mutex;

use super::types::{AgentMessage, Role, TokenUsage, ToolCall};

lazy_static! {
    /// Shared, connection-pooled HTTP client, mirroring the rationale for keeping exactly
    /// one client per process: warm TLS sessions and DNS lookups instead of paying that
    /// cost on every provider call.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build shared HTTP client");
}

pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// A tool schema advertised to the provider. `client.*` tools are filtered out before this
/// reaches any adapter (§4.5 step 6, §4.9) — enforced by `prepare::without_client_tool_calls`
/// and by `ToolSchema::advertisable` below as a second line of defense.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    pub fn advertisable(schemas: &[ToolSchema]) -> Vec<&ToolSchema> {
        schemas
            .iter()
            .filter(|s| !s.name.starts_with(super::prepare::CLIENT_TOOL_PREFIX))
            .collect()
    }
}

/// Discriminated result of one provider call.
#[derive(Debug, Clone)]
pub enum LLMResponse {
    Text {
        content: String,
        usage: Option<TokenUsage>,
    },
    ToolCalls {
        /// The assistant's own textual preamble, if any, alongside the calls.
        content: String,
        calls: Vec<ToolCall>,
        usage: Option<TokenUsage>,
    },
}

/// Invoked once per streamed chunk when streaming is enabled; receives raw text deltas.
pub type ChunkCallback<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// Pure LLM client contract. Implementations normalise their native tool-call format into
/// `LLMResponse::ToolCalls`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(
        &self,
        messages: &[AgentMessage],
        tools: &[ToolSchema],
        on_chunk: Option<&ChunkCallback<'_>>,
    ) -> Result<LLMResponse, super::error::WorldError>;

    fn model_name(&self) -> &str;
}

fn to_wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// OpenAI-style chat-completions adapter (also fits any OpenAI-compatible gateway).
pub struct OpenAiAdapter {
    api_key: String,
    base_url: String,
    model: String,
    usage: Mutex<Option<TokenUsage>>,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        OpenAiAdapter {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.into(),
            usage: Mutex::new(None),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[AgentMessage],
        tools: &[ToolSchema],
        on_chunk: Option<&ChunkCallback<'_>>,
    ) -> Result<LLMResponse, super::error::WorldError> {
        let wire_messages: Vec<_> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": to_wire_role(m.role),
                    "content": m.content,
                })
            })
            .collect();
        let wire_tools: Vec<_> = ToolSchema::advertisable(tools)
            .into_iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
        });
        if !wire_tools.is_empty() {
            body["tools"] = serde_json::Value::Array(wire_tools);
        }

        let response = shared_http_client()
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| super::error::WorldError::Provider(e.to_string()))?;

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| super::error::WorldError::Provider(e.to_string()))?;

        if let Some(usage) = payload.get("usage") {
            let tracked = TokenUsage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
            };
            *self.usage.lock().await = Some(tracked);
        }

        let message = &payload["choices"][0]["message"];
        let content = message["content"].as_str().unwrap_or("").to_string();
        if let Some(chunk_cb) = on_chunk {
            chunk_cb(&content);
        }

        if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
            if !tool_calls.is_empty() {
                let calls = tool_calls
                    .iter()
                    .map(|c| ToolCall {
                        id: c["id"].as_str().unwrap_or_default().to_string(),
                        name: c["function"]["name"].as_str().unwrap_or_default().to_string(),
                        arguments: serde_json::from_str(
                            c["function"]["arguments"].as_str().unwrap_or("{}"),
                        )
                        .unwrap_or(serde_json::Value::Null),
                    })
                    .collect();
                return Ok(LLMResponse::ToolCalls {
                    content,
                    calls,
                    usage: self.usage.lock().await.clone(),
                });
            }
        }

        Ok(LLMResponse::Text {
            content,
            usage: self.usage.lock().await.clone(),
        })
    }
}

/// Anthropic-style `/v1/messages` adapter. Tool-call normalisation follows the
/// `content: [{type: "tool_use", ...}]` shape rather than OpenAI's `tool_calls` array.
pub struct AnthropicAdapter {
    api_key: String,
    base_url: String,
    model: String,
    usage: Mutex<Option<TokenUsage>>,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        AnthropicAdapter {
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            model: model.into(),
            usage: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[AgentMessage],
        tools: &[ToolSchema],
        on_chunk: Option<&ChunkCallback<'_>>,
    ) -> Result<LLMResponse, super::error::WorldError> {
        let system_prompt = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let wire_messages: Vec<_> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                serde_json::json!({
                    "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                    "content": m.content,
                })
            })
            .collect();
        let wire_tools: Vec<_> = ToolSchema::advertisable(tools)
            .into_iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "system": system_prompt,
            "messages": wire_messages,
            "max_tokens": 4096,
        });
        if !wire_tools.is_empty() {
            body["tools"] = serde_json::Value::Array(wire_tools);
        }

        let response = shared_http_client()
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| super::error::WorldError::Provider(e.to_string()))?;

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| super::error::WorldError::Provider(e.to_string()))?;

        if let Some(usage) = payload.get("usage") {
            let tracked = TokenUsage {
                prompt_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                total_tokens: (usage["input_tokens"].as_u64().unwrap_or(0)
                    + usage["output_tokens"].as_u64().unwrap_or(0)) as u32,
            };
            *self.usage.lock().await = Some(tracked);
        }

        let blocks = payload["content"].as_array().cloned().unwrap_or_default();
        let mut text = String::new();
        let mut calls = Vec::new();
        for block in &blocks {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
                Some("tool_use") => calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block["input"].clone(),
                }),
                _ => {}
            }
        }
        if let Some(chunk_cb) = on_chunk {
            chunk_cb(&text);
        }

        if !calls.is_empty() {
            return Ok(LLMResponse::ToolCalls {
                content: text,
                calls,
                usage: self.usage.lock().await.clone(),
            });
        }
        Ok(LLMResponse::Text {
            content: text,
            usage: self.usage.lock().await.clone(),
        })
    }
}

/// Google-style `generateContent` adapter.
pub struct GoogleAdapter {
    api_key: String,
    base_url: String,
    model: String,
    usage: Mutex<Option<TokenUsage>>,
}

impl GoogleAdapter {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        GoogleAdapter {
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: model.into(),
            usage: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[AgentMessage],
        tools: &[ToolSchema],
        on_chunk: Option<&ChunkCallback<'_>>,
    ) -> Result<LLMResponse, super::error::WorldError> {
        let contents: Vec<_> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                serde_json::json!({
                    "role": if m.role == Role::Assistant { "model" } else { "user" },
                    "parts": [{"text": m.content}],
                })
            })
            .collect();
        let system_instruction = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| serde_json::json!({"parts": [{"text": m.content}]}));
        let function_declarations: Vec<_> = ToolSchema::advertisable(tools)
            .into_iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();

        let mut body = serde_json::json!({"contents": contents});
        if let Some(system) = system_instruction {
            body["systemInstruction"] = system;
        }
        if !function_declarations.is_empty() {
            body["tools"] = serde_json::json!([{"functionDeclarations": function_declarations}]);
        }

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let response = shared_http_client()
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| super::error::WorldError::Provider(e.to_string()))?;

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| super::error::WorldError::Provider(e.to_string()))?;

        if let Some(usage) = payload.get("usageMetadata") {
            let tracked = TokenUsage {
                prompt_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
                total_tokens: usage["totalTokenCount"].as_u64().unwrap_or(0) as u32,
            };
            *self.usage.lock().await = Some(tracked);
        }

        let parts = payload["candidates"][0]["content"]["parts"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let mut text = String::new();
        let mut calls = Vec::new();
        for part in &parts {
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
            if let Some(call) = part.get("functionCall") {
                calls.push(ToolCall {
                    id: format!("google-call-{}", calls.len()),
                    name: call["name"].as_str().unwrap_or_default().to_string(),
                    arguments: call["args"].clone(),
                });
            }
        }
        if let Some(chunk_cb) = on_chunk {
            chunk_cb(&text);
        }

        if !calls.is_empty() {
            return Ok(LLMResponse::ToolCalls {
                content: text,
                calls,
                usage: self.usage.lock().await.clone(),
            });
        }
        Ok(LLMResponse::Text {
            content: text,
            usage: self.usage.lock().await.clone(),
        })
    }
}

/// Resolves an `AgentConfig.provider` tag to a concrete adapter.
pub fn adapter_for(provider: &str, api_key: &str, model: &str) -> Arc<dyn ProviderAdapter> {
    match provider {
        "anthropic" | "claude" => Arc::new(AnthropicAdapter::new(api_key, model)),
        "google" | "gemini" => Arc::new(GoogleAdapter::new(api_key, model)),
        _ => Arc::new(OpenAiAdapter::new(api_key, model)),
    }
}
