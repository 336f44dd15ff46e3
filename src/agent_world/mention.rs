//! Pure mention parsing and auto-mention rewriting.
//!
//! Every function here is a pure string transform: case-insensitive on names, tolerant of
//! leading whitespace, and idempotent. None of them touch the bus, storage, or an agent's
//! memory — keeping them pure is what lets the orchestrator and the historical-relevance
//! filter share one implementation (§4.3.1 and §4.5 both delegate to `extract_*` here).

/// All `@name` occurrences anywhere in `text`, in order of appearance, names as written.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut mentions = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'@' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && is_mention_char(bytes[end]) {
                end += 1;
            }
            if end > start {
                mentions.push(text[start..end].to_string());
                i = end;
                continue;
            }
        }
        i += 1;
    }
    mentions
}

fn is_mention_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// Mentions that sit at a paragraph beginning: start-of-string, or immediately after a
/// newline once any leading spaces/tabs on that line are skipped.
pub fn extract_paragraph_beginning_mentions(text: &str) -> Vec<String> {
    let mut mentions = Vec::new();
    for line_start in paragraph_start_offsets(text) {
        let rest = &text[line_start..];
        let trimmed = rest.trim_start_matches([' ', '\t']);
        if let Some(stripped) = trimmed.strip_prefix('@') {
            let end = stripped
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
                .unwrap_or(stripped.len());
            if end > 0 {
                mentions.push(stripped[..end].to_string());
            }
        }
    }
    mentions
}

/// Byte offsets where a new paragraph begins: 0, and the position right after every `\n`.
fn paragraph_start_offsets(text: &str) -> Vec<usize> {
    let mut offsets = vec![0];
    for (idx, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            offsets.push(idx + 1);
        }
    }
    offsets
}

/// True iff `text` opens any paragraph with an `@mention`.
pub fn has_any_mention_at_beginning(text: &str) -> bool {
    !extract_paragraph_beginning_mentions(text).is_empty()
}

/// Prepends `@target ` to `text` unless it already opens a paragraph with any `@mention`.
/// Idempotent: calling this twice with the same target is a no-op the second time, since
/// after the first call the text now opens with `@target`.
pub fn add_auto_mention(text: &str, target: &str) -> String {
    if has_any_mention_at_beginning(text) {
        return text.to_string();
    }
    format!("@{target} {text}")
}

/// Strips only paragraph-beginning mentions of `agent_id` (case-insensitive); mentions of
/// the same id elsewhere in a paragraph are left untouched.
pub fn remove_self_mentions(text: &str, agent_id: &str) -> String {
    let agent_lower = agent_id.to_ascii_lowercase();
    let offsets = paragraph_start_offsets(text);
    let mut result = String::with_capacity(text.len());
    let mut cursor = 0;

    for (para_idx, &start) in offsets.iter().enumerate() {
        let para_end = offsets.get(para_idx + 1).copied().unwrap_or(text.len());
        result.push_str(&text[cursor..start]);
        let para = &text[start..para_end];
        let leading_len = para.len() - para.trim_start_matches([' ', '\t']).len();
        let (leading, rest) = para.split_at(leading_len);
        if let Some(stripped) = rest.strip_prefix('@') {
            let name_end = stripped
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
                .unwrap_or(stripped.len());
            let name = &stripped[..name_end];
            if name.to_ascii_lowercase() == agent_lower {
                let after_name = &stripped[name_end..];
                let after_name = after_name.strip_prefix(' ').unwrap_or(after_name);
                result.push_str(leading);
                result.push_str(after_name);
                cursor = para_end;
                continue;
            }
        }
        result.push_str(para);
        cursor = para_end;
    }
    result
}
