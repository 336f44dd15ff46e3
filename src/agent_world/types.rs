//! Core data model: World, Agent, Chat, AgentMessage, Event and their supporting types.
//!
//! Everything here is a plain value type — no back-pointers. Cyclic references between
//! world/agent/memory/event are represented by id + lookup rather than by `Rc`/`Weak` chains,
//! keeping the whole participant graph flat and addressed by id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a single `AgentMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// A single LLM-requested tool invocation, attached to an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Per-tool_call_id completion tracking stored on the assistant turn that issued it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallStatusEntry {
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// One entry in an agent's memory, or a wire event's conversational payload.
///
/// `tool_call_status` keys by `tool_call_id`; it is the only field ever mutated in place on
/// an already-persisted message (everything else is append-only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: Role,
    pub content: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_status: Option<HashMap<String, ToolCallStatusEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl AgentMessage {
    /// Builder entry point: the only two fields every message must have up front.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        AgentMessage {
            role,
            content: content.into(),
            message_id: Uuid::new_v4().to_string(),
            reply_to_message_id: None,
            chat_id: None,
            agent_id: None,
            sender: None,
            tool_calls: None,
            tool_call_id: None,
            tool_call_status: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = id.into();
        self
    }

    pub fn with_reply_to(mut self, id: impl Into<String>) -> Self {
        self.reply_to_message_id = Some(id.into());
        self
    }

    pub fn with_chat_id(mut self, id: impl Into<String>) -> Self {
        self.chat_id = Some(id.into());
        self
    }

    pub fn with_agent_id(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(calls);
        self
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    /// True once every tool_call issued by this assistant turn has a complete status entry.
    pub fn all_tool_calls_complete(&self) -> bool {
        match (&self.tool_calls, &self.tool_call_status) {
            (Some(calls), Some(status)) => calls
                .iter()
                .all(|c| status.get(&c.id).map(|s| s.complete).unwrap_or(false)),
            (Some(calls), None) => calls.is_empty(),
            (None, _) => true,
        }
    }
}

/// Per-agent configuration: provider selection travels with the agent, not the global config.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub turn_limit: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            turn_limit: 5,
        }
    }
}

/// An LLM-backed participant: identity, prompt, provider selection, and memory.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    pub config: AgentConfig,
    /// Consecutive LLM calls made since the last human/world-origin message reset it.
    pub llm_call_count: u32,
    /// Ordered, append-only conversation memory (see invariants in the data model).
    pub memory: Vec<AgentMessage>,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Agent {
            id: id.into(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            config: AgentConfig::default(),
            llm_call_count: 0,
            memory: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn turn_limit(&self) -> u32 {
        self.config.turn_limit
    }

    pub fn reset_turn_counter(&mut self) {
        self.llm_call_count = 0;
    }
}

/// A logical conversation grouping within a world.
#[derive(Debug, Clone)]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        Chat {
            id: id.into(),
            name: "New Chat".to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn is_untitled(&self) -> bool {
        self.name == "New Chat"
    }
}

/// Discriminator for the six named bus channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Message,
    Sse,
    Tool,
    System,
    World,
    Crud,
}

/// SSE lifecycle slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SseKind {
    Start,
    Chunk,
    End,
}

/// Subtype-specific payload carried by an `Event`. Kept as a tagged enum (rather than a
/// grab-bag of optional fields) so each publisher constructs exactly the shape it means.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "__payload_type")]
pub enum EventPayload {
    Message(AgentMessage),
    Sse {
        kind: SseKind,
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    World {
        pending_operations: u32,
        kind: WorldActivityKind,
        reason: Option<String>,
    },
    Crud {
        entity: String,
        action: String,
    },
    System {
        text: String,
    },
    Tool {
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorldActivityKind {
    ResponseStart,
    ResponseEnd,
    Idle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single bus event as persisted/dispatched. Never mutated once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(event_type: EventType, payload: EventPayload) -> Self {
        Event {
            id: Uuid::new_v4().to_string(),
            event_type,
            sender: None,
            content: None,
            chat_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }
}

/// Enhanced envelope carried in `AgentMessage::content` for the one sanctioned tool-result
/// shape. Centralising parsing here gives the rest of the crate a single vocabulary, per the
/// re-architecture guidance on dynamic payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEnvelope {
    #[serde(rename = "__type")]
    pub type_tag: String,
    pub tool_call_id: String,
    pub decision: ApprovalDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ApprovalScope>,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Execution outcome, filled in once the tool-message handler has actually run (or
    /// declined to run) the tool. Absent on the inbound envelope a client publishes; present
    /// on the envelope persisted back into memory, so both the approval decision/scope and
    /// the outcome the LLM needs to see live in the same message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ToolResultEnvelope {
    pub const TYPE_TAG: &'static str = "tool_result";

    pub fn new(
        tool_call_id: impl Into<String>,
        decision: ApprovalDecision,
        tool_name: impl Into<String>,
    ) -> Self {
        ToolResultEnvelope {
            type_tag: Self::TYPE_TAG.to_string(),
            tool_call_id: tool_call_id.into(),
            decision,
            scope: None,
            tool_name: tool_name.into(),
            tool_args: None,
            working_directory: None,
            result: None,
        }
    }

    pub fn with_scope(mut self, scope: ApprovalScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_tool_args(mut self, args: serde_json::Value) -> Self {
        self.tool_args = Some(args);
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalScope {
    Once,
    Session,
}

/// Parsed form of a raw message's `content`, with `role` resolved the way
/// `publishMessage` resolves it: tool envelope beats human-sender-pattern beats default
/// assistant.
#[derive(Debug, Clone)]
pub enum ParsedMessageContent {
    ToolResult(ToolResultEnvelope),
    Plain { role: Role, text: String },
}

/// Classifies a sender string as the human actor, matching `HUMAN`, `human`, or any
/// `user*` spelling case-insensitively.
pub fn is_human_sender(sender: &str) -> bool {
    let lower = sender.to_ascii_lowercase();
    lower == "human" || lower.starts_with("user")
}

/// Resolves a raw `content` payload into role + structured form, trying the enhanced
/// envelope first and falling back to plain text with a sender-derived role.
pub fn parse_message_content(content: &str, sender: &str) -> ParsedMessageContent {
    if let Ok(envelope) = serde_json::from_str::<ToolResultEnvelope>(content) {
        if envelope.type_tag == ToolResultEnvelope::TYPE_TAG {
            return ParsedMessageContent::ToolResult(envelope);
        }
    }
    let role = if sender == "world" {
        Role::User
    } else if is_human_sender(sender) {
        Role::User
    } else {
        Role::Assistant
    };
    ParsedMessageContent::Plain {
        role,
        text: content.to_string(),
    }
}
