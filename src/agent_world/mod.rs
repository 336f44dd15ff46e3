//! Agent World core runtime: event bus, agent orchestrator, tool-approval state machine,
//! and per-agent conversation memory.

pub mod activity;
pub mod approval;
pub mod bus;
pub mod config;
pub mod error;
pub mod memory;
pub mod mention;
pub mod orchestrator;
pub mod persistence;
pub mod prepare;
pub mod provider;
pub mod storage;
pub mod subscribers;
pub mod title;
pub mod types;
pub mod world;

pub use bus::{
    publish_crud_event, publish_event, publish_message, publish_sse, publish_tool_event,
    publish_tool_result, EventBus, EventSubscriber, ToolResultRequest,
};
pub use config::RuntimeConfig;
pub use error::{WorldError, WorldResult};
pub use orchestrator::{process_agent_message, should_agent_respond, OrchestratorContext};
pub use provider::{adapter_for, LLMResponse, ProviderAdapter, ToolSchema};
pub use storage::{InMemoryStorage, JsonlStorage, Storage};
pub use types::{
    Agent, AgentConfig, AgentMessage, ApprovalDecision, ApprovalScope, Chat, Event, EventPayload,
    EventType, Role, SseKind, ToolCall, ToolCallStatusEntry, ToolResultEnvelope,
};
pub use world::{World, WorldRegistry};
