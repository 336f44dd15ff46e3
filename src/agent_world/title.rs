//! Chat title generation, triggered by the world activity listener on `idle` (§4.2, §4.6).
//!
//! Title updates are gated on the chat still being named `"New Chat"` at the moment of
//! idle, and the listener itself guarantees at most one `chat-title-updated` system event
//! per conversation turn regardless of how many agents participated.

const MAX_TITLE_LEN: usize = 60;

/// Derives a short title from the first user-authored message in a set of accumulated
/// messages. Pure and deterministic so it is trivial to test without a provider call; a
/// production embedding may instead delegate this to an LLM summarisation call, but the
/// runtime itself only needs a reasonable default.
pub fn generate_title(messages: &[super::types::AgentMessage]) -> String {
    let first_user_text = messages
        .iter()
        .find(|m| m.role == super::types::Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("");

    let collapsed: String = first_user_text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return "New Chat".to_string();
    }
    truncate_at_char_boundary(&collapsed, MAX_TITLE_LEN)
}

fn truncate_at_char_boundary(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_len.saturating_sub(1)).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_world::types::{AgentMessage, Role};

    #[test]
    fn generates_title_from_first_user_message() {
        let messages = vec![
            AgentMessage::new(Role::System, "be helpful"),
            AgentMessage::new(Role::User, "how do I parse a CSV file in Rust"),
        ];
        assert_eq!(generate_title(&messages), "how do I parse a CSV file in Rust");
    }

    #[test]
    fn falls_back_to_new_chat_with_no_user_message() {
        let messages = vec![AgentMessage::new(Role::System, "be helpful")];
        assert_eq!(generate_title(&messages), "New Chat");
    }

    #[test]
    fn truncates_long_titles() {
        let long = "a".repeat(200);
        let messages = vec![AgentMessage::new(Role::User, long)];
        let title = generate_title(&messages);
        assert_eq!(title.chars().count(), MAX_TITLE_LEN);
        assert!(title.ends_with('…'));
    }
}
