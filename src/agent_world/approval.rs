//! Tool-approval state machine.
//!
//! State lives entirely in the agent's conversation memory — there is deliberately no
//! separate approval cache here, matching §4.4/§5's "memory is the source of truth" rule.
//! This eliminates an entire class of cache-vs-memory drift bugs.

use serde_json::Value;

use super::types::{AgentMessage, ApprovalDecision, ApprovalScope, ParsedMessageContent, Role};

/// Heuristic risk classifier: a tool needs approval if its name or description contains
/// any configured dangerous keyword, case-insensitively.
pub fn needs_approval(tool_name: &str, description: &str, dangerous_keywords: &[String]) -> bool {
    let haystack = format!("{tool_name} {description}").to_ascii_lowercase();
    dangerous_keywords
        .iter()
        .any(|kw| haystack.contains(&kw.to_ascii_lowercase()))
}

/// Scans `memory` for a tool-role message granting session-scope approval for `tool_name`.
pub fn find_session_approval(memory: &[AgentMessage], tool_name: &str) -> bool {
    memory.iter().any(|msg| {
        if msg.role != Role::Tool {
            return false;
        }
        match parse_tool_message(msg) {
            Some(envelope) => {
                envelope.decision == ApprovalDecision::Approve
                    && envelope.scope == Some(ApprovalScope::Session)
                    && envelope.tool_name == tool_name
            }
            None => false,
        }
    })
}

/// Finds an approve/once result for `tool_name` that has not yet been consumed. "Consumed"
/// means the assistant turn that issued the original tool_call already carries a completed
/// `tool_call_status` entry for it.
pub fn find_once_approval(memory: &[AgentMessage], tool_name: &str) -> Option<&AgentMessage> {
    memory.iter().find(|msg| {
        if msg.role != Role::Tool {
            return false;
        }
        let envelope = match parse_tool_message(msg) {
            Some(e) => e,
            None => return false,
        };
        if envelope.decision != ApprovalDecision::Approve
            || envelope.scope != Some(ApprovalScope::Once)
            || envelope.tool_name != tool_name
        {
            return false;
        }
        !is_consumed(memory, &envelope.tool_call_id)
    })
}

/// True once the assistant turn that issued `tool_call_id` shows a completed status entry
/// for it.
fn is_consumed(memory: &[AgentMessage], tool_call_id: &str) -> bool {
    memory.iter().any(|msg| {
        msg.role == Role::Assistant
            && msg
                .tool_calls
                .as_ref()
                .map(|calls| calls.iter().any(|c| c.id == tool_call_id))
                .unwrap_or(false)
            && msg
                .tool_call_status
                .as_ref()
                .and_then(|status| status.get(tool_call_id))
                .map(|s| s.complete)
                .unwrap_or(false)
    })
}

fn parse_tool_message(msg: &AgentMessage) -> Option<super::types::ToolResultEnvelope> {
    match super::types::parse_message_content(&msg.content, msg.sender.as_deref().unwrap_or("")) {
        ParsedMessageContent::ToolResult(envelope) => Some(envelope),
        ParsedMessageContent::Plain { .. } => None,
    }
}

/// The outcome of consulting the approval checker for a pending tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    /// Execution may proceed without a fresh request (policy doesn't demand it, or an
    /// active session/once approval already covers this call).
    NotRequired,
    /// A `client.requestApproval` tool_call must be raised; execution waits.
    Required,
}

/// Consults session/once approvals in memory before falling back to the risk heuristic.
pub fn check_approval(
    memory: &[AgentMessage],
    tool_name: &str,
    description: &str,
    dangerous_keywords: &[String],
) -> ApprovalOutcome {
    if find_session_approval(memory, tool_name) {
        return ApprovalOutcome::NotRequired;
    }
    if find_once_approval(memory, tool_name).is_some() {
        return ApprovalOutcome::NotRequired;
    }
    if needs_approval(tool_name, description, dangerous_keywords) {
        ApprovalOutcome::Required
    } else {
        ApprovalOutcome::NotRequired
    }
}

/// Redacts sensitive argument values before echoing them back in an approval prompt.
/// Keys matching any configured sensitive substring (case-insensitive) are replaced
/// wholesale with the literal `"[REDACTED]"`.
pub fn redact_sensitive_args(args: &Value, sensitive_keys: &[String]) -> Value {
    match args {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                let key_lower = key.to_ascii_lowercase();
                if sensitive_keys
                    .iter()
                    .any(|s| key_lower.contains(&s.to_ascii_lowercase()))
                {
                    redacted.insert(key.clone(), Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key.clone(), redact_sensitive_args(value, sensitive_keys));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| redact_sensitive_args(v, sensitive_keys))
                .collect(),
        ),
        other => other.clone(),
    }
}
