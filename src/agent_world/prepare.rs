//! Message preparation: builds the sequence handed to the LLM provider (§4.5).
//!
//! The dual-layer rule is absolute: storage keeps everything an agent has ever seen;
//! `prepare_messages` keeps only what the LLM itself should think about. Every filter here
//! is pure — it reads `Agent` and returns a new `Vec<AgentMessage>`, never mutating memory.

use super::orchestrator::should_agent_respond;
use super::types::{Agent, AgentMessage, Role};

/// Prefix used for approval-response `tool_call_id`s so the LLM never has to parse or
/// imitate the client-approval dance (step 6 of §4.5).
pub const APPROVAL_TOOL_CALL_PREFIX: &str = "approval_";

/// Tool name namespace reserved for client-only pseudo-tools (`client.requestApproval`,
/// etc). Never advertised to a provider and never shown in the prepared sequence.
pub const CLIENT_TOOL_PREFIX: &str = "client.";

/// Builds the LLM-ready message sequence for `agent`, scoped to `active_chat_id` (a `None`
/// chat is its own bucket, distinct from any `Some` chat id).
///
/// Steps mirror §4.5 1:1: chat scoping, agent-perspective scoping, the historical-relevance
/// filter over user-role messages, stripping client-facing tool artefacts, dropping turns
/// that become empty, and prepending the system prompt.
pub fn prepare_messages(agent: &Agent, active_chat_id: Option<&str>) -> Vec<AgentMessage> {
    let scoped = agent
        .memory
        .iter()
        .filter(|m| m.chat_id.as_deref() == active_chat_id)
        .filter(|m| m.agent_id.as_deref() == Some(agent.id.as_str()))
        .filter(|m| historical_relevance_filter(agent, m));

    let mut prepared: Vec<AgentMessage> = scoped
        .filter_map(|m| strip_client_artifacts(m))
        .map(without_client_tool_calls)
        .filter(|m| !is_empty_assistant_turn(m))
        .collect();

    let mut sequence = Vec::with_capacity(prepared.len() + 1);
    sequence.push(AgentMessage::new(Role::System, agent.system_prompt.clone()));
    sequence.append(&mut prepared);
    sequence
}

/// §4.5 step 5: for user-role messages, keep only those this agent would itself have chosen
/// to respond to — eliminating overheard-but-irrelevant broadcast chatter from the context
/// the LLM sees. Non-user-role messages pass through unfiltered (Open Question #3,
/// recorded in DESIGN.md: the filter is scoped to user-role messages exactly as written).
fn historical_relevance_filter(agent: &Agent, message: &AgentMessage) -> bool {
    if message.role != Role::User {
        return true;
    }
    should_agent_respond(agent, message)
}

/// §4.5 step 6: strips `client.*` tool_calls from an assistant turn and drops tool-role
/// messages whose `tool_call_id` is an approval-response artefact. Returns `None` when the
/// whole message should be omitted (a tool-role approval-response message).
fn strip_client_artifacts(message: &AgentMessage) -> Option<&AgentMessage> {
    if message.role == Role::Tool {
        if let Some(id) = &message.tool_call_id {
            if id.starts_with(APPROVAL_TOOL_CALL_PREFIX) {
                return None;
            }
        }
    }
    Some(message)
}

/// §4.5 step 7: an assistant turn becomes empty once its `client.*` tool_calls are removed
/// and no non-client-prefixed call nor textual content remains.
fn is_empty_assistant_turn(message: &AgentMessage) -> bool {
    if message.role != Role::Assistant {
        return false;
    }
    let has_content = !message.content.trim().is_empty();
    let has_surviving_tool_calls = message
        .tool_calls
        .as_ref()
        .map(|calls| calls.iter().any(|c| !c.name.starts_with(CLIENT_TOOL_PREFIX)))
        .unwrap_or(false);
    !has_content && !has_surviving_tool_calls
}

/// Called on an assistant turn before it is added to the prepared sequence's clone, to drop
/// only the `client.*` entries from its `tool_calls` while keeping any others — used
/// internally by callers that need the filtered tool_calls rather than an all-or-nothing
/// keep/drop decision. Exposed so provider adapters can double-check no client tool ever
/// makes it into an outgoing schema.
pub fn without_client_tool_calls(message: &AgentMessage) -> AgentMessage {
    let mut clone = message.clone();
    if let Some(calls) = &clone.tool_calls {
        let filtered: Vec<_> = calls
            .iter()
            .filter(|c| !c.name.starts_with(CLIENT_TOOL_PREFIX))
            .cloned()
            .collect();
        clone.tool_calls = if filtered.is_empty() { None } else { Some(filtered) };
    }
    clone
}
