//! Subscribers & routing (§4.2): the two handlers every agent attaches to the `message`
//! channel, plus the shell executor the tool-message handler drives for `shell_cmd`.

use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use log::warn;
use tokio::process::Command as TokioCommand;

use super::bus::EventSubscriber;
use super::memory::{append_message, mark_tool_call_status, owns_tool_call};
use super::orchestrator::{process_agent_message, resume_after_tool, should_agent_respond};
use super::types::{
    AgentMessage, ApprovalDecision, Event, EventPayload, ParsedMessageContent, Role,
    ToolResultEnvelope,
};
use super::world::World;

/// Agent message handler (§4.2 #1): drops tool-role events (handled by #2 below), applies
/// the respond decision, and on acceptance writes the incoming message to memory and kicks
/// off the orchestrator for that agent.
pub struct AgentMessageSubscriber {
    pub world: Weak<World>,
    pub agent_id: String,
}

#[async_trait]
impl EventSubscriber for AgentMessageSubscriber {
    async fn handle(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let world = match self.world.upgrade() {
            Some(w) => w,
            None => return Ok(()),
        };
        let incoming = match &event.payload {
            EventPayload::Message(msg) => msg,
            _ => return Ok(()),
        };
        if incoming.role == Role::Tool {
            return Ok(());
        }

        let agent_lock = match world.agent_lock(&self.agent_id).await {
            Some(lock) => lock,
            None => return Ok(()),
        };
        let mut agent = agent_lock.lock().await;

        if !should_agent_respond(&agent, incoming) {
            return Ok(());
        }

        let mut stamped = incoming.clone();
        stamped.agent_id = Some(self.agent_id.clone());
        if let Err(error) = append_message(&mut agent, stamped.clone()) {
            warn!("agent '{}' failed to record incoming message: {error}", self.agent_id);
            return Ok(());
        }

        let chat_id = stamped.chat_id.clone().or_else(|| world.current_chat_id());
        let ctx = world.orchestrator_context(&agent).await;
        process_agent_message(&ctx, &mut agent, Some(&stamped), chat_id.as_deref()).await?;
        world.storage.save_agent(&world.id, &agent).map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
        Ok(())
    }
}

/// Tool message handler (§4.2 #2): keeps only `role: tool` events, enforces the
/// ownership/hijack check, executes or persists-as-declared on approve, persists a denial
/// on deny, updates `toolCallStatus`, and resumes the LLM loop.
pub struct ToolMessageSubscriber {
    pub world: Weak<World>,
    pub agent_id: String,
}

#[async_trait]
impl EventSubscriber for ToolMessageSubscriber {
    async fn handle(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let world = match self.world.upgrade() {
            Some(w) => w,
            None => return Ok(()),
        };
        let incoming = match &event.payload {
            EventPayload::Message(msg) if msg.role == Role::Tool => msg,
            _ => return Ok(()),
        };

        let envelope = match super::types::parse_message_content(
            &incoming.content,
            incoming.sender.as_deref().unwrap_or(""),
        ) {
            ParsedMessageContent::ToolResult(envelope) => envelope,
            ParsedMessageContent::Plain { .. } => return Ok(()),
        };

        let agent_lock = match world.agent_lock(&self.agent_id).await {
            Some(lock) => lock,
            None => return Ok(()),
        };
        let mut agent = agent_lock.lock().await;

        // Ownership check (§3, §8 scenario 5): refuse silently-but-audibly on hijack attempts.
        if !owns_tool_call(&agent, &envelope.tool_call_id) {
            warn!(
                "agent '{}' received tool_call_id '{}' not found in its own memory; refusing (possible hijack attempt)",
                self.agent_id, envelope.tool_call_id
            );
            return Ok(());
        }

        let chat_id = incoming.chat_id.clone().or_else(|| world.current_chat_id());
        let execution_result = match envelope.decision {
            ApprovalDecision::Approve => {
                if envelope.tool_name == "shell_cmd" {
                    run_shell_command(&envelope).await
                } else {
                    serde_json::json!({"declared": true, "args": envelope.tool_args})
                }
            }
            ApprovalDecision::Deny => serde_json::json!({"denied": true}),
        };

        // Persist the envelope itself, not just the execution result, so a later call to
        // the same tool can recover `decision`/`scope`/`tool_name` from memory
        // (`find_session_approval`/`find_once_approval` in approval.rs parse exactly this
        // shape back out). `result` carries the outcome the LLM needs to see, since no
        // provider adapter reads `tool_call_status` for wire content.
        let persisted_envelope = envelope.clone().with_result(execution_result.clone());
        let tool_message_content = serde_json::to_string(&persisted_envelope).unwrap_or_default();
        let mut tool_message = AgentMessage::new(Role::Tool, tool_message_content)
            .with_sender(self.agent_id.clone())
            .with_tool_call_id(envelope.tool_call_id.clone());
        if let Some(chat_id) = &chat_id {
            tool_message = tool_message.with_chat_id(chat_id.clone());
        }
        if let Err(error) = append_message(&mut agent, tool_message) {
            warn!("agent '{}' failed to record tool result: {error}", self.agent_id);
            return Ok(());
        }

        if let Err(error) = mark_tool_call_status(
            &mut agent,
            &envelope.tool_call_id,
            true,
            Some(execution_result),
        ) {
            warn!("agent '{}' failed to update tool_call_status: {error}", self.agent_id);
        }

        let ctx = world.orchestrator_context(&agent).await;
        resume_after_tool(&ctx, &mut agent, chat_id.as_deref()).await?;
        world.storage.save_agent(&world.id, &agent).map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
        Ok(())
    }
}

/// Minimal shell executor grounded on the same `Platform`/timeout idiom the rest of this
/// codebase's bash tool uses, scoped down to exactly what the tool-message handler needs:
/// run one command, capture stdout/stderr/exit code, never panic on a spawn failure.
async fn run_shell_command(envelope: &ToolResultEnvelope) -> serde_json::Value {
    let command = envelope
        .tool_args
        .as_ref()
        .and_then(|args| args.get("command"))
        .and_then(|c| c.as_str())
        .unwrap_or("");

    let start = Instant::now();
    let mut cmd = TokioCommand::new("/bin/bash");
    cmd.arg("-c").arg(command);
    if let Some(dir) = &envelope.working_directory {
        cmd.current_dir(dir);
    }

    match cmd.output().await {
        Ok(output) => serde_json::json!({
            "success": output.status.success(),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exit_code": output.status.code().unwrap_or(-1),
            "duration_ms": start.elapsed().as_millis() as u64,
        }),
        Err(error) => serde_json::json!({
            "success": false,
            "stdout": "",
            "stderr": format!("failed to spawn shell: {error}"),
            "exit_code": -1,
            "duration_ms": start.elapsed().as_millis() as u64,
        }),
    }
}
