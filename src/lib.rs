// src/lib.rs

pub mod agent_world;

pub use agent_world::{
    adapter_for, publish_message, publish_tool_result, Agent, AgentConfig, AgentMessage,
    ApprovalDecision, ApprovalScope, Chat, Event, EventBus, EventPayload, EventType,
    InMemoryStorage, JsonlStorage, LLMResponse, ProviderAdapter, Role, RuntimeConfig, SseKind,
    Storage, ToolCall, ToolCallStatusEntry, ToolResultEnvelope, ToolResultRequest, ToolSchema,
    World, WorldError, WorldRegistry, WorldResult,
};
