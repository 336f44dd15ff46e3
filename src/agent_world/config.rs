//! Runtime configuration knobs.
//!
//! Deliberately minimal, same restraint as the rest of this crate's configuration story:
//! a plain struct with a `Default` impl, built by the embedding application. No TOML/YAML/
//! env-file parsing crate is introduced here.

/// Process-wide and per-agent-default knobs recognised by the runtime.
///
/// Per-agent `provider`/`model`/`temperature` deliberately do NOT live here — they travel
/// with `AgentConfig` in `types.rs`, the same way model selection travels with the agent
/// rather than the global config elsewhere in this crate.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default max consecutive LLM calls per human/world turn, per agent.
    pub turn_limit: u32,
    /// Process-wide flag gating SSE chunk emission. Start/end markers are unaffected.
    pub streaming_enabled: bool,
    /// Case-insensitive substrings that mark a tool as requiring approval when found in
    /// its name or description.
    pub dangerous_tool_keywords: Vec<String>,
    /// Case-insensitive substrings of argument keys that get redacted before being echoed
    /// back in an approval prompt.
    pub sensitive_argument_keys: Vec<String>,
    /// Iteration cap for a single `processAgentMessage` invocation.
    pub max_loop_iterations: u32,
    /// Bound on the per-world error log retained for storage/edit/delete failures.
    pub error_log_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            turn_limit: 5,
            streaming_enabled: true,
            dangerous_tool_keywords: vec![
                "execute".to_string(),
                "command".to_string(),
                "delete".to_string(),
                "remove".to_string(),
                "write".to_string(),
                "shell".to_string(),
            ],
            sensitive_argument_keys: vec![
                "key".to_string(),
                "password".to_string(),
                "token".to_string(),
                "secret".to_string(),
                "auth".to_string(),
            ],
            max_loop_iterations: 10,
            error_log_capacity: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.turn_limit, 5);
        assert!(cfg.streaming_enabled);
        assert_eq!(cfg.max_loop_iterations, 10);
        assert_eq!(cfg.error_log_capacity, 100);
        assert!(cfg.dangerous_tool_keywords.iter().any(|k| k == "shell"));
        assert!(cfg.sensitive_argument_keys.iter().any(|k| k == "secret"));
    }
}
