//! Memory manager: append-only writes into an agent's conversation memory.
//!
//! This is the only place messages are pushed into `Agent::memory`. Centralising it here
//! enforces the invariants from §3 at the single write point rather than scattering checks
//! across the orchestrator: every append gets a `messageId` if it lacks one, every
//! `replyToMessageId` is checked against the reply-chain depth bound, and self-referential
//! replies are rejected outright.

use super::error::{WorldError, WorldResult};
use super::types::{Agent, AgentMessage};

/// Reply chains longer than this are rejected — guards against a malformed or adversarial
/// `replyToMessageId` chain growing unbounded.
pub const MAX_REPLY_CHAIN_DEPTH: usize = 100;

/// Appends `message` to `agent.memory`, stamping `chatId`/`agentId` if not already set and
/// validating the reply-chain invariants against the agent's existing memory.
pub fn append_message(agent: &mut Agent, mut message: AgentMessage) -> WorldResult<()> {
    if message.message_id.is_empty() {
        return Err(WorldError::InvalidMessage(
            "message_id must not be empty".to_string(),
        ));
    }
    if let Some(reply_to) = &message.reply_to_message_id {
        if reply_to == &message.message_id {
            return Err(WorldError::InvalidMessage(format!(
                "message {} cannot reply to itself",
                message.message_id
            )));
        }
        let depth = reply_chain_depth(&agent.memory, reply_to);
        if depth + 1 > MAX_REPLY_CHAIN_DEPTH {
            return Err(WorldError::InvalidMessage(format!(
                "reply chain for message {} exceeds max depth {}",
                message.message_id, MAX_REPLY_CHAIN_DEPTH
            )));
        }
    }
    if message.agent_id.is_none() {
        message.agent_id = Some(agent.id.clone());
    }
    agent.memory.push(message);
    Ok(())
}

/// Walks backwards through `reply_to_message_id` links already present in `memory` to find
/// how deep the chain already is above `start_from`. Returns 0 if `start_from` is not found
/// or has no further ancestor.
fn reply_chain_depth(memory: &[AgentMessage], start_from: &str) -> usize {
    let mut depth = 0;
    let mut current = start_from.to_string();
    loop {
        let found = memory.iter().find(|m| m.message_id == current);
        match found.and_then(|m| m.reply_to_message_id.clone()) {
            Some(parent) => {
                depth += 1;
                if depth > MAX_REPLY_CHAIN_DEPTH {
                    return depth;
                }
                current = parent;
            }
            None => break,
        }
    }
    depth
}

/// Mutates the `tool_call_status` entry on the assistant turn that issued `tool_call_id`.
/// This is the only field ever permitted to be rewritten on an already-persisted message.
pub fn mark_tool_call_status(
    agent: &mut Agent,
    tool_call_id: &str,
    complete: bool,
    result: Option<serde_json::Value>,
) -> WorldResult<()> {
    let turn = agent.memory.iter_mut().find(|m| {
        m.tool_calls
            .as_ref()
            .map(|calls| calls.iter().any(|c| c.id == tool_call_id))
            .unwrap_or(false)
    });
    match turn {
        Some(turn) => {
            let status_map = turn.tool_call_status.get_or_insert_with(Default::default);
            status_map.insert(
                tool_call_id.to_string(),
                super::types::ToolCallStatusEntry { complete, result },
            );
            Ok(())
        }
        None => Err(WorldError::Tool(format!(
            "no assistant turn in agent '{}' memory issued tool_call_id {tool_call_id}",
            agent.id
        ))),
    }
}

/// Ownership invariant check (§3): a tool-role message may only be honoured if its
/// `tool_call_id` appears in some prior assistant turn in the SAME agent's memory. This is
/// what prevents the cross-agent tool-hijack scenario in §8 scenario 5.
pub fn owns_tool_call(agent: &Agent, tool_call_id: &str) -> bool {
    agent.memory.iter().any(|m| {
        m.tool_calls
            .as_ref()
            .map(|calls| calls.iter().any(|c| c.id == tool_call_id))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_world::types::Role;

    fn test_agent() -> Agent {
        Agent::new("a1", "Agent One", "system prompt")
    }

    #[test]
    fn append_rejects_empty_message_id() {
        let mut agent = test_agent();
        let msg = AgentMessage::new(Role::User, "hi").with_message_id("");
        assert!(append_message(&mut agent, msg).is_err());
    }

    #[test]
    fn append_rejects_self_referential_reply() {
        let mut agent = test_agent();
        let msg = AgentMessage::new(Role::User, "hi")
            .with_message_id("m1")
            .with_reply_to("m1");
        assert!(append_message(&mut agent, msg).is_err());
    }

    #[test]
    fn append_stamps_agent_id_when_absent() {
        let mut agent = test_agent();
        let msg = AgentMessage::new(Role::User, "hi").with_message_id("m1");
        append_message(&mut agent, msg).unwrap();
        assert_eq!(agent.memory[0].agent_id.as_deref(), Some("a1"));
    }

    #[test]
    fn reply_chain_depth_is_bounded() {
        let mut agent = test_agent();
        let mut prev_id = "root".to_string();
        append_message(&mut agent, AgentMessage::new(Role::User, "root").with_message_id(prev_id.clone()))
            .unwrap();
        for i in 0..MAX_REPLY_CHAIN_DEPTH {
            let id = format!("m{i}");
            let msg = AgentMessage::new(Role::Assistant, "x")
                .with_message_id(id.clone())
                .with_reply_to(prev_id.clone());
            append_message(&mut agent, msg).unwrap();
            prev_id = id;
        }
        let overflow = AgentMessage::new(Role::Assistant, "one too many")
            .with_message_id("overflow")
            .with_reply_to(prev_id);
        assert!(append_message(&mut agent, overflow).is_err());
    }

    #[test]
    fn owns_tool_call_detects_cross_agent_hijack() {
        use crate::agent_world::types::ToolCall;
        let mut owner = Agent::new("a1", "Owner", "prompt");
        let assistant_turn = AgentMessage::new(Role::Assistant, "").with_tool_calls(vec![ToolCall {
            id: "call-1".to_string(),
            name: "shell_cmd".to_string(),
            arguments: serde_json::json!({}),
        }]);
        append_message(&mut owner, assistant_turn).unwrap();
        assert!(owns_tool_call(&owner, "call-1"));

        let attacker = Agent::new("a2", "Attacker", "prompt");
        assert!(!owns_tool_call(&attacker, "call-1"));
    }

    #[test]
    fn mark_tool_call_status_updates_existing_turn() {
        use crate::agent_world::types::ToolCall;
        let mut agent = test_agent();
        let assistant_turn = AgentMessage::new(Role::Assistant, "").with_tool_calls(vec![ToolCall {
            id: "call-1".to_string(),
            name: "shell_cmd".to_string(),
            arguments: serde_json::json!({}),
        }]);
        append_message(&mut agent, assistant_turn).unwrap();
        mark_tool_call_status(&mut agent, "call-1", true, Some(serde_json::json!({"ok": true}))).unwrap();
        assert!(agent.memory[0].all_tool_calls_complete());
    }
}
