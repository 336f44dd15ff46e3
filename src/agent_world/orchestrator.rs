//! Agent orchestrator: the iterative LLM↔tool loop (§4.3).
//!
//! `process_agent_message` is the one re-entrant loop in the whole runtime. It is invoked
//! either by the agent-message subscriber (§4.2 handler #1) when `should_agent_respond`
//! accepts an incoming message, or by the tool-message subscriber (§4.2 handler #2, via
//! `resume_after_tool`) once a tool result has landed in memory. Both call sites funnel
//! through here so turn-limit bookkeeping and activity tracking only live in one place.

use std::sync::Arc;

use log::warn;
use uuid::Uuid;

use super::activity::ActivityTracker;
use super::approval::{check_approval, redact_sensitive_args, ApprovalOutcome};
use super::bus::{publish_message, publish_sse, publish_tool_result, EventBus, ToolResultRequest};
use super::config::RuntimeConfig;
use super::error::WorldResult;
use super::mention::{
    add_auto_mention, extract_mentions, extract_paragraph_beginning_mentions, remove_self_mentions,
};
use super::memory::append_message;
use super::prepare::prepare_messages;
use super::provider::{LLMResponse, ProviderAdapter, ToolSchema};
use super::types::{
    Agent, AgentMessage, ApprovalDecision, ApprovalScope, Event, EventPayload, EventType, Role,
    SseKind, ToolCall, ToolCallStatusEntry,
};

/// Literal marker required verbatim in the turn-limit system message (§4.3.2 step 1
/// and the boundary behaviour in §8).
pub const TURN_LIMIT_MARKER: &str = "Turn limit reached";

/// Deterministic pure predicate — §4.3.1. Shared by the agent-message subscriber (deciding
/// whether to engage at all) and by the historical-relevance filter in `prepare.rs` (deciding
/// whether a past message belongs in this agent's LLM-facing context).
pub fn should_agent_respond(agent: &Agent, message: &AgentMessage) -> bool {
    let sender = message.sender.as_deref().unwrap_or("");

    if sender == agent.id {
        return false;
    }
    if message.content.contains(TURN_LIMIT_MARKER) {
        return false;
    }
    if sender == "system" {
        return false;
    }
    if sender == "world" {
        return true;
    }

    let paragraph_mentions = extract_paragraph_beginning_mentions(&message.content);
    let any_mentions = extract_mentions(&message.content);
    let agent_mentioned_at_start = paragraph_mentions
        .iter()
        .any(|m| m.eq_ignore_ascii_case(&agent.id));

    if super::bus::sender_is_human(sender) {
        if paragraph_mentions.is_empty() && any_mentions.is_empty() {
            return true;
        }
        if paragraph_mentions.is_empty() {
            return false;
        }
        return agent_mentioned_at_start;
    }

    agent_mentioned_at_start
}

/// Outcome of one `handle_tool_calls` invocation.
enum ToolCallOutcome {
    /// Either no approval was needed, or it was needed and a `client.requestApproval`
    /// request was raised. In both cases the loop stops here — real execution (or the
    /// human's decision) resumes asynchronously through the tool-message handler.
    LoopShouldStop,
}

/// Dependencies the orchestrator needs injected rather than constructed itself, so tests can
/// supply a `MockProviderAdapter` and an in-memory bus without touching the network.
pub struct OrchestratorContext {
    pub bus: Arc<EventBus>,
    pub provider: Arc<dyn ProviderAdapter>,
    pub tool_schemas: Vec<ToolSchema>,
    pub activity: Arc<ActivityTracker>,
    pub config: RuntimeConfig,
}

/// Runs the iterative loop for one triggering message. `triggering` is `None` on resumption
/// after a tool result (§4.3.5) — the prior chain already in memory is sufficient context.
pub async fn process_agent_message(
    ctx: &OrchestratorContext,
    agent: &mut Agent,
    triggering: Option<&AgentMessage>,
    active_chat_id: Option<&str>,
) -> WorldResult<()> {
    let token = ctx.activity.begin(format!("agent:{}", agent.id));

    let resets_turn_counter = triggering
        .map(|m| {
            let sender = m.sender.as_deref().unwrap_or("");
            super::bus::sender_is_human(sender) || sender == "world"
        })
        .unwrap_or(false);
    if resets_turn_counter {
        agent.reset_turn_counter();
    }

    let result = run_loop(ctx, agent, triggering, active_chat_id).await;
    token.complete();
    result
}

async fn run_loop(
    ctx: &OrchestratorContext,
    agent: &mut Agent,
    triggering: Option<&AgentMessage>,
    active_chat_id: Option<&str>,
) -> WorldResult<()> {
    for _ in 0..ctx.config.max_loop_iterations {
        if agent.llm_call_count >= agent.turn_limit() {
            emit_turn_limit_reached(ctx, agent, triggering, active_chat_id);
            return Ok(());
        }

        let prepared = prepare_messages(agent, active_chat_id);
        agent.llm_call_count += 1;

        // §4.3.2 step 3 / §4.1 `publishSSE`: the response message id is minted up front so
        // the start/chunk/end trio and the eventual persisted assistant turn all key off the
        // same id, which is what lets `persistence.rs`'s composite-id scheme store them.
        let response_message_id = Uuid::new_v4().to_string();
        let sse_chat_id = active_chat_id.map(|s| s.to_string());
        publish_sse(
            &ctx.bus,
            &agent.id,
            SseKind::Start,
            &response_message_id,
            None,
            None,
            sse_chat_id.clone(),
        );

        let chunk_bus = Arc::clone(&ctx.bus);
        let chunk_agent_id = agent.id.clone();
        let chunk_message_id = response_message_id.clone();
        let chunk_chat_id = sse_chat_id.clone();
        let on_chunk = move |text: &str| {
            publish_sse(
                &chunk_bus,
                &chunk_agent_id,
                SseKind::Chunk,
                &chunk_message_id,
                Some(text.to_string()),
                None,
                chunk_chat_id.clone(),
            );
        };

        let response = ctx
            .provider
            .complete(&prepared, &ctx.tool_schemas, Some(&on_chunk))
            .await;

        let response = match response {
            Ok(r) => r,
            Err(error) => {
                publish_sse(
                    &ctx.bus,
                    &agent.id,
                    SseKind::End,
                    &response_message_id,
                    None,
                    None,
                    sse_chat_id.clone(),
                );
                warn!("provider call failed for agent '{}': {error}", agent.id);
                emit_provider_failure(ctx, agent, triggering, active_chat_id, &error.to_string());
                return Ok(());
            }
        };

        let usage = match &response {
            LLMResponse::Text { usage, .. } => usage.clone(),
            LLMResponse::ToolCalls { usage, .. } => usage.clone(),
        };
        publish_sse(
            &ctx.bus,
            &agent.id,
            SseKind::End,
            &response_message_id,
            None,
            usage,
            sse_chat_id,
        );

        match response {
            LLMResponse::Text { content, .. } => {
                handle_text_response(
                    ctx,
                    agent,
                    &content,
                    triggering,
                    active_chat_id,
                    &response_message_id,
                );
                return Ok(());
            }
            LLMResponse::ToolCalls { content, calls, .. } => {
                match handle_tool_calls(
                    ctx,
                    agent,
                    &content,
                    calls,
                    triggering,
                    active_chat_id,
                    &response_message_id,
                ) {
                    ToolCallOutcome::LoopShouldStop => return Ok(()),
                }
            }
        }
    }
    Ok(())
}

fn emit_turn_limit_reached(
    ctx: &OrchestratorContext,
    agent: &mut Agent,
    triggering: Option<&AgentMessage>,
    active_chat_id: Option<&str>,
) {
    let text = format!("@human {TURN_LIMIT_MARKER}");
    let mut message = AgentMessage::new(Role::System, text.clone()).with_sender(agent.id.clone());
    if let Some(chat_id) = active_chat_id {
        message = message.with_chat_id(chat_id.to_string());
    }
    if let Some(trigger) = triggering {
        message = message.with_reply_to(trigger.message_id.clone());
    }
    let message_for_bus = message.clone();
    let _ = append_message(agent, message);

    // Not `publish_message`: its sender-based role inference would turn `agent.id` back
    // into `Role::Assistant`, diverging from the `Role::System` turn just appended to
    // memory. Emit the already-correctly-typed message directly instead.
    let mut event = Event::new(EventType::Message, EventPayload::Message(message_for_bus.clone()))
        .with_id(message_for_bus.message_id.clone())
        .with_sender(agent.id.clone())
        .with_content(text);
    if let Some(chat_id) = active_chat_id {
        event = event.with_chat_id(chat_id.to_string());
    }
    ctx.bus.emit(event);
}

fn emit_provider_failure(
    ctx: &OrchestratorContext,
    agent: &Agent,
    triggering: Option<&AgentMessage>,
    active_chat_id: Option<&str>,
    error: &str,
) {
    let text = format!("Provider error for agent {}: {error}", agent.id);
    publish_message(
        &ctx.bus,
        &text,
        "system",
        active_chat_id.map(|s| s.to_string()),
        None,
        triggering.map(|t| t.message_id.clone()),
    );
}

/// §4.3.3: process only the first tool_call; persist the full assistant turn; consult
/// approval; either raise a `client.requestApproval` request or synthesise an
/// already-approved tool-result so the tool-message handler can execute it.
fn handle_tool_calls(
    ctx: &OrchestratorContext,
    agent: &mut Agent,
    content: &str,
    calls: Vec<ToolCall>,
    triggering: Option<&AgentMessage>,
    active_chat_id: Option<&str>,
    response_message_id: &str,
) -> ToolCallOutcome {
    if calls.len() > 1 {
        warn!(
            "agent '{}' LLM turn returned {} tool_calls, dropping {} (processing only the first)",
            agent.id,
            calls.len(),
            calls.len() - 1
        );
    }
    let first = calls[0].clone();

    let mut assistant_turn = AgentMessage::new(Role::Assistant, content.to_string())
        .with_message_id(response_message_id.to_string())
        .with_sender(agent.id.clone())
        .with_tool_calls(calls);
    if let Some(chat_id) = active_chat_id {
        assistant_turn = assistant_turn.with_chat_id(chat_id.to_string());
    }
    if let Some(trigger) = triggering {
        assistant_turn = assistant_turn.with_reply_to(trigger.message_id.clone());
    }
    let assistant_message_id = assistant_turn.message_id.clone();
    let _ = append_message(agent, assistant_turn.clone());

    publish_message(
        &ctx.bus,
        content,
        &agent.id,
        active_chat_id.map(|s| s.to_string()),
        Some(assistant_message_id.clone()),
        triggering.map(|t| t.message_id.clone()),
    );

    let tool_description = tool_description_for(ctx, &first.name);
    let outcome = check_approval(
        &agent.memory,
        &first.name,
        &tool_description,
        &ctx.config.dangerous_tool_keywords,
    );

    match outcome {
        ApprovalOutcome::NotRequired => {
            publish_tool_result(
                &ctx.bus,
                active_chat_id.map(|s| s.to_string()),
                ToolResultRequest {
                    tool_call_id: first.id.clone(),
                    decision: ApprovalDecision::Approve,
                    scope: None,
                    tool_name: first.name.clone(),
                    tool_args: Some(first.arguments.clone()),
                    working_directory: None,
                },
            );
        }
        ApprovalOutcome::Required => {
            let redacted_args = redact_sensitive_args(&first.arguments, &ctx.config.sensitive_argument_keys);
            let approval_args = serde_json::json!({
                "originalToolCall": {
                    "id": first.id,
                    "name": first.name,
                    "args": redacted_args,
                },
                "message": format!("Approve execution of '{}'?", first.name),
                "options": ["deny", "approve_once", "approve_session"],
            });
            let approval_call = ToolCall {
                id: format!("{}{}", super::prepare::APPROVAL_TOOL_CALL_PREFIX, first.id),
                name: "client.requestApproval".to_string(),
                arguments: approval_args,
            };
            let mut approval_turn = AgentMessage::new(Role::Assistant, String::new())
                .with_sender(agent.id.clone())
                .with_reply_to(assistant_message_id)
                .with_tool_calls(vec![approval_call]);
            if let Some(chat_id) = active_chat_id {
                approval_turn = approval_turn.with_chat_id(chat_id.to_string());
            }
            let mut status = std::collections::HashMap::new();
            status.insert(
                format!("{}{}", super::prepare::APPROVAL_TOOL_CALL_PREFIX, first.id),
                ToolCallStatusEntry {
                    complete: false,
                    result: None,
                },
            );
            approval_turn.tool_call_status = Some(status);
            let approval_turn_clone = approval_turn.clone();
            let _ = append_message(agent, approval_turn);
            publish_message(
                &ctx.bus,
                "",
                &agent.id,
                active_chat_id.map(|s| s.to_string()),
                Some(approval_turn_clone.message_id),
                None,
            );
        }
    }

    ToolCallOutcome::LoopShouldStop
}

fn tool_description_for(ctx: &OrchestratorContext, tool_name: &str) -> String {
    ctx.tool_schemas
        .iter()
        .find(|t| t.name == tool_name)
        .map(|t| t.description.clone())
        .unwrap_or_default()
}

/// §4.3.4: apply auto-mention rules to the final text, append it to memory, publish it.
fn handle_text_response(
    ctx: &OrchestratorContext,
    agent: &mut Agent,
    content: &str,
    triggering: Option<&AgentMessage>,
    active_chat_id: Option<&str>,
    response_message_id: &str,
) {
    let stripped = remove_self_mentions(content, &agent.id);
    let final_text = match triggering {
        Some(trigger) => {
            let origin = trigger.sender.as_deref().unwrap_or("");
            let from_other_agent = !origin.is_empty()
                && origin != agent.id
                && !super::bus::sender_is_human(origin)
                && origin != "world"
                && origin != "system";
            if from_other_agent {
                add_auto_mention(&stripped, origin)
            } else {
                stripped
            }
        }
        None => stripped,
    };

    let mut message = AgentMessage::new(Role::Assistant, final_text.clone())
        .with_message_id(response_message_id.to_string())
        .with_sender(agent.id.clone());
    if let Some(chat_id) = active_chat_id {
        message = message.with_chat_id(chat_id.to_string());
    }
    if let Some(trigger) = triggering {
        message = message.with_reply_to(trigger.message_id.clone());
    }
    let message_id = message.message_id.clone();
    let _ = append_message(agent, message);

    publish_message(
        &ctx.bus,
        &final_text,
        &agent.id,
        active_chat_id.map(|s| s.to_string()),
        Some(message_id),
        triggering.map(|t| t.message_id.clone()),
    );
}

/// §4.3.5: re-enters the loop with no triggering event once a tool-role message has been
/// appended to memory by the tool-message handler.
pub async fn resume_after_tool(
    ctx: &OrchestratorContext,
    agent: &mut Agent,
    active_chat_id: Option<&str>,
) -> WorldResult<()> {
    process_agent_message(ctx, agent, None, active_chat_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn human_message(content: &str) -> AgentMessage {
        AgentMessage::new(Role::User, content)
            .with_message_id("m1")
            .with_sender("human")
    }

    #[test]
    fn rejects_self_response() {
        let agent = Agent::new("a1", "Agent One", "prompt");
        let mut msg = human_message("hi");
        msg.sender = Some("a1".to_string());
        assert!(!should_agent_respond(&agent, &msg));
    }

    #[test]
    fn rejects_turn_limit_marker() {
        let agent = Agent::new("a1", "Agent One", "prompt");
        let msg = human_message(&format!("@human {TURN_LIMIT_MARKER}"));
        assert!(!should_agent_respond(&agent, &msg));
    }

    #[test]
    fn rejects_system_sender() {
        let agent = Agent::new("a1", "Agent One", "prompt");
        let mut msg = human_message("hi");
        msg.sender = Some("system".to_string());
        assert!(!should_agent_respond(&agent, &msg));
    }

    #[test]
    fn accepts_world_sender_unconditionally() {
        let agent = Agent::new("a1", "Agent One", "prompt");
        let mut msg = human_message("anything");
        msg.sender = Some("world".to_string());
        assert!(should_agent_respond(&agent, &msg));
    }

    #[test]
    fn human_public_broadcast_with_no_mentions_is_accepted() {
        let agent = Agent::new("a1", "Agent One", "prompt");
        let msg = human_message("hi");
        assert!(should_agent_respond(&agent, &msg));
    }

    #[test]
    fn human_mid_text_mention_is_rejected() {
        let agent = Agent::new("a1", "Agent One", "prompt");
        let msg = human_message("I think @a1 would know.");
        assert!(!should_agent_respond(&agent, &msg));
    }

    #[test]
    fn human_paragraph_beginning_mention_is_accepted_for_named_agent_only() {
        let agent = Agent::new("a1", "Agent One", "prompt");
        let msg_for_a1 = human_message("@a1 can you help?");
        assert!(should_agent_respond(&agent, &msg_for_a1));
        let msg_for_a2 = human_message("@a2 can you help?");
        assert!(!should_agent_respond(&agent, &msg_for_a2));
    }

    #[test]
    fn agent_origin_requires_paragraph_beginning_mention() {
        let agent = Agent::new("a1", "Agent One", "prompt");
        let mut msg = human_message("@a1 hello from a peer");
        msg.sender = Some("a2".to_string());
        assert!(should_agent_respond(&agent, &msg));

        let mut msg_mid = human_message("hello, cc @a1");
        msg_mid.sender = Some("a2".to_string());
        assert!(!should_agent_respond(&agent, &msg_mid));
    }
}
