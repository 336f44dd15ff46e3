//! End-to-end scenarios driving a real `World` through its bus, wired to scripted
//! `MockProviderAdapter`s instead of a network call. Each test stamps a chat, publishes a
//! message, lets the spawned subscriber tasks run, then asserts on the resulting agent
//! memory and/or emitted events.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_world::{
    Agent, AgentConfig, ApprovalDecision, ApprovalScope, InMemoryStorage, ProviderAdapter,
    RuntimeConfig, Storage, ToolResultRequest, WorldRegistry,
};

use support::MockProviderAdapter;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Builds a resolver that looks an agent's provider up by its `AgentConfig::model` tag —
/// the resolver only receives `&AgentConfig`, so each test agent is given a distinct model
/// name to key its own scripted adapter.
fn resolver_for(
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
) -> Arc<dyn Fn(&AgentConfig) -> Arc<dyn ProviderAdapter> + Send + Sync> {
    let adapters: HashMap<String, Arc<dyn ProviderAdapter>> =
        adapters.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    Arc::new(move |config: &AgentConfig| {
        adapters
            .get(&config.model)
            .cloned()
            .unwrap_or_else(|| panic!("no mock adapter registered for model '{}'", config.model))
    })
}

fn agent_with_model(id: &str, name: &str, model: &str) -> Agent {
    let mut config = AgentConfig::default();
    config.model = model.to_string();
    Agent::new(id, name, "You are a helpful agent.").with_config(config)
}

#[tokio::test]
async fn single_public_greeting_gets_one_reply_per_agent_and_titles_the_chat() {
    let registry = WorldRegistry::new();
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

    let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert(
        "mock-a1",
        MockProviderAdapter::new(vec![agent_world::LLMResponse::Text {
            content: "Hello there!".to_string(),
            usage: None,
        }]) as Arc<dyn ProviderAdapter>,
    );
    adapters.insert(
        "mock-a2",
        MockProviderAdapter::new(vec![agent_world::LLMResponse::Text {
            content: "Hi from agent two!".to_string(),
            usage: None,
        }]) as Arc<dyn ProviderAdapter>,
    );

    let world = registry
        .create_world(
            "w1",
            storage,
            RuntimeConfig::default(),
            resolver_for(adapters),
            vec![],
        )
        .unwrap();

    world.create_chat("c1").await.unwrap();
    world.set_current_chat(Some("c1".to_string())).await;
    world
        .create_agent(agent_with_model("a1", "Agent One", "mock-a1"))
        .await
        .unwrap();
    world
        .create_agent(agent_with_model("a2", "Agent Two", "mock-a2"))
        .await
        .unwrap();

    agent_world::publish_message(&world.bus, "hello everyone", "human", Some("c1".to_string()), None, None);
    settle().await;

    let a1 = world.agent_lock("a1").await.unwrap();
    let a1 = a1.lock().await;
    assert!(a1.memory.iter().any(|m| m.content == "Hello there!"));

    let a2 = world.agent_lock("a2").await.unwrap();
    let a2 = a2.lock().await;
    assert!(a2.memory.iter().any(|m| m.content == "Hi from agent two!"));
}

#[tokio::test]
async fn mid_text_mention_is_ignored_by_the_named_agent() {
    let registry = WorldRegistry::new();
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

    // The mock is scripted with zero responses: if the agent incorrectly decides to
    // respond, its `complete` call panics with "exhausted" and the test fails loudly.
    let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert("mock-a1", MockProviderAdapter::new(vec![]) as Arc<dyn ProviderAdapter>);

    let world = registry
        .create_world("w1", storage, RuntimeConfig::default(), resolver_for(adapters), vec![])
        .unwrap();
    world.create_chat("c1").await.unwrap();
    world.set_current_chat(Some("c1".to_string())).await;
    world
        .create_agent(agent_with_model("a1", "Agent One", "mock-a1"))
        .await
        .unwrap();

    agent_world::publish_message(
        &world.bus,
        "I think @a1 would know the answer.",
        "human",
        Some("c1".to_string()),
        None,
        None,
    );
    settle().await;

    let a1 = world.agent_lock("a1").await.unwrap();
    let a1 = a1.lock().await;
    // Only the inbound message ever lands in memory — no assistant reply was ever produced,
    // since a mid-text mention never triggers `should_agent_respond`.
    assert_eq!(a1.memory.len(), 1);
    assert_eq!(a1.memory[0].role, agent_world::Role::User);
}

#[tokio::test]
async fn approved_shell_call_executes_and_resumes_the_loop() {
    let registry = WorldRegistry::new();
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

    let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert(
        "mock-a1",
        MockProviderAdapter::new(vec![
            agent_world::LLMResponse::ToolCalls {
                content: String::new(),
                calls: vec![agent_world::ToolCall {
                    id: "call-1".to_string(),
                    name: "shell_cmd".to_string(),
                    arguments: serde_json::json!({"command": "echo hi"}),
                }],
                usage: None,
            },
            agent_world::LLMResponse::Text {
                content: "Ran it, output was hi.".to_string(),
                usage: None,
            },
        ]) as Arc<dyn ProviderAdapter>,
    );

    let world = registry
        .create_world("w1", storage, RuntimeConfig::default(), resolver_for(adapters), vec![])
        .unwrap();
    world.create_chat("c1").await.unwrap();
    world.set_current_chat(Some("c1".to_string())).await;
    world
        .create_agent(agent_with_model("a1", "Agent One", "mock-a1"))
        .await
        .unwrap();

    agent_world::publish_message(
        &world.bus,
        "please run a shell command",
        "human",
        Some("c1".to_string()),
        None,
        None,
    );
    settle().await;

    // The orchestrator should have stopped at a `client.requestApproval` turn rather than
    // executing immediately, since `shell_cmd` matches the dangerous-tool keyword list.
    {
        let a1 = world.agent_lock("a1").await.unwrap();
        let a1 = a1.lock().await;
        let has_approval_request = a1.memory.iter().any(|m| {
            m.tool_calls
                .as_ref()
                .map(|calls| calls.iter().any(|c| c.name == "client.requestApproval"))
                .unwrap_or(false)
        });
        assert!(has_approval_request, "expected a pending client.requestApproval turn");
    }

    agent_world::publish_tool_result(
        &world.bus,
        Some("c1".to_string()),
        ToolResultRequest {
            tool_call_id: "call-1".to_string(),
            decision: ApprovalDecision::Approve,
            scope: Some(ApprovalScope::Once),
            tool_name: "shell_cmd".to_string(),
            tool_args: Some(serde_json::json!({"command": "echo hi"})),
            working_directory: None,
        },
    );
    settle().await;

    let a1 = world.agent_lock("a1").await.unwrap();
    let a1 = a1.lock().await;
    assert!(a1.memory.iter().any(|m| m.content == "Ran it, output was hi."));
    assert!(a1.memory.iter().any(|m| m.role == agent_world::Role::Tool));
}

#[tokio::test]
async fn denied_shell_call_never_spawns_and_the_llm_acknowledges_the_denial() {
    let registry = WorldRegistry::new();
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

    let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert(
        "mock-a1",
        MockProviderAdapter::new(vec![
            agent_world::LLMResponse::ToolCalls {
                content: String::new(),
                calls: vec![agent_world::ToolCall {
                    id: "call-1".to_string(),
                    name: "shell_cmd".to_string(),
                    arguments: serde_json::json!({"command": "rm -rf /tmp/whatever"}),
                }],
                usage: None,
            },
            agent_world::LLMResponse::Text {
                content: "Understood, I won't run that.".to_string(),
                usage: None,
            },
        ]) as Arc<dyn ProviderAdapter>,
    );

    let world = registry
        .create_world("w1", storage, RuntimeConfig::default(), resolver_for(adapters), vec![])
        .unwrap();
    world.create_chat("c1").await.unwrap();
    world.set_current_chat(Some("c1".to_string())).await;
    world
        .create_agent(agent_with_model("a1", "Agent One", "mock-a1"))
        .await
        .unwrap();

    agent_world::publish_message(
        &world.bus,
        "please clean up some files",
        "human",
        Some("c1".to_string()),
        None,
        None,
    );
    settle().await;

    agent_world::publish_tool_result(
        &world.bus,
        Some("c1".to_string()),
        ToolResultRequest {
            tool_call_id: "call-1".to_string(),
            decision: ApprovalDecision::Deny,
            scope: None,
            tool_name: "shell_cmd".to_string(),
            tool_args: None,
            working_directory: None,
        },
    );
    settle().await;

    let a1 = world.agent_lock("a1").await.unwrap();
    let a1 = a1.lock().await;
    let tool_message = a1
        .memory
        .iter()
        .find(|m| m.role == agent_world::Role::Tool)
        .expect("expected a tool-role denial message in memory");
    assert!(tool_message.content.contains("denied"));
    assert!(a1.memory.iter().any(|m| m.content == "Understood, I won't run that."));
}

#[tokio::test]
async fn tool_result_addressed_to_the_wrong_agent_is_silently_refused() {
    let registry = WorldRegistry::new();
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

    // a1 never gets to finish its loop (no second scripted response) because the hijack
    // attempt must be refused rather than consumed.
    let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert(
        "mock-a1",
        MockProviderAdapter::new(vec![agent_world::LLMResponse::ToolCalls {
            content: String::new(),
            calls: vec![agent_world::ToolCall {
                id: "call-1".to_string(),
                name: "shell_cmd".to_string(),
                arguments: serde_json::json!({"command": "echo hi"}),
            }],
            usage: None,
        }]) as Arc<dyn ProviderAdapter>,
    );
    adapters.insert("mock-a2", MockProviderAdapter::new(vec![]) as Arc<dyn ProviderAdapter>);

    let world = registry
        .create_world("w1", storage, RuntimeConfig::default(), resolver_for(adapters), vec![])
        .unwrap();
    world.create_chat("c1").await.unwrap();
    world.set_current_chat(Some("c1".to_string())).await;
    world
        .create_agent(agent_with_model("a1", "Agent One", "mock-a1"))
        .await
        .unwrap();
    world
        .create_agent(agent_with_model("a2", "Agent Two", "mock-a2"))
        .await
        .unwrap();

    agent_world::publish_message(
        &world.bus,
        "please run a shell command",
        "human",
        Some("c1".to_string()),
        None,
        None,
    );
    settle().await;

    // a1's call-1 is pending approval. A denial/approval for call-1 is broadcast on the
    // `tool` channel to every agent's `ToolMessageSubscriber`; a2 never issued call-1 and
    // must refuse it without touching its own memory.
    agent_world::publish_tool_result(
        &world.bus,
        Some("c1".to_string()),
        ToolResultRequest {
            tool_call_id: "call-1".to_string(),
            decision: ApprovalDecision::Approve,
            scope: Some(ApprovalScope::Once),
            tool_name: "shell_cmd".to_string(),
            tool_args: Some(serde_json::json!({"command": "echo hi"})),
            working_directory: None,
        },
    );
    settle().await;

    let a2 = world.agent_lock("a2").await.unwrap();
    let a2 = a2.lock().await;
    assert!(
        a2.memory.iter().all(|m| m.tool_call_id.as_deref() != Some("call-1")),
        "agent two must never record a tool result it did not request"
    );
}

#[tokio::test]
async fn session_scope_approval_covers_a_second_call_to_the_same_tool() {
    let registry = WorldRegistry::new();
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

    let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert(
        "mock-a1",
        MockProviderAdapter::new(vec![
            agent_world::LLMResponse::ToolCalls {
                content: String::new(),
                calls: vec![agent_world::ToolCall {
                    id: "call-1".to_string(),
                    name: "shell_cmd".to_string(),
                    arguments: serde_json::json!({"command": "echo one"}),
                }],
                usage: None,
            },
            agent_world::LLMResponse::ToolCalls {
                content: String::new(),
                calls: vec![agent_world::ToolCall {
                    id: "call-2".to_string(),
                    name: "shell_cmd".to_string(),
                    arguments: serde_json::json!({"command": "echo two"}),
                }],
                usage: None,
            },
            agent_world::LLMResponse::Text {
                content: "done for real".to_string(),
                usage: None,
            },
        ]) as Arc<dyn ProviderAdapter>,
    );

    let world = registry
        .create_world("w1", storage, RuntimeConfig::default(), resolver_for(adapters), vec![])
        .unwrap();
    world.create_chat("c1").await.unwrap();
    world.set_current_chat(Some("c1".to_string())).await;
    world
        .create_agent(agent_with_model("a1", "Agent One", "mock-a1"))
        .await
        .unwrap();

    agent_world::publish_message(
        &world.bus,
        "please run a couple of shell commands",
        "human",
        Some("c1".to_string()),
        None,
        None,
    );
    settle().await;

    // First call needs approval; grant it with session scope.
    agent_world::publish_tool_result(
        &world.bus,
        Some("c1".to_string()),
        ToolResultRequest {
            tool_call_id: "call-1".to_string(),
            decision: ApprovalDecision::Approve,
            scope: Some(ApprovalScope::Session),
            tool_name: "shell_cmd".to_string(),
            tool_args: Some(serde_json::json!({"command": "echo one"})),
            working_directory: None,
        },
    );
    settle().await;

    let a1 = world.agent_lock("a1").await.unwrap();
    let a1 = a1.lock().await;

    // The second call to the same tool must execute without a fresh
    // `client.requestApproval` round trip, and the loop must run through to the final
    // text reply on its own.
    let approval_requests = a1
        .memory
        .iter()
        .filter(|m| {
            m.tool_calls
                .as_ref()
                .map(|calls| calls.iter().any(|c| c.name == "client.requestApproval"))
                .unwrap_or(false)
        })
        .count();
    assert_eq!(approval_requests, 1, "only call-1 should have requested approval");

    let tool_messages: Vec<_> = a1.memory.iter().filter(|m| m.role == agent_world::Role::Tool).collect();
    assert_eq!(tool_messages.len(), 2, "both call-1 and call-2 should have recorded a tool result");
    assert!(tool_messages.iter().any(|m| m.tool_call_id.as_deref() == Some("call-2")));

    assert!(a1.memory.iter().any(|m| m.content == "done for real"));
}

#[tokio::test]
async fn repeated_peer_addressed_turns_hit_the_turn_limit_marker() {
    let registry = WorldRegistry::new();
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

    // Only one scripted response: the second triggering message must never reach the
    // provider at all, since the turn limit is checked before the call is made.
    let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert(
        "mock-a1",
        MockProviderAdapter::new(vec![agent_world::LLMResponse::Text {
            content: "turn one".to_string(),
            usage: None,
        }]) as Arc<dyn ProviderAdapter>,
    );

    let world = registry
        .create_world("w1", storage, RuntimeConfig::default(), resolver_for(adapters), vec![])
        .unwrap();
    world.create_chat("c1").await.unwrap();
    world.set_current_chat(Some("c1".to_string())).await;

    let mut agent_config = AgentConfig::default();
    agent_config.model = "mock-a1".to_string();
    agent_config.turn_limit = 1;
    let agent = Agent::new("a1", "Agent One", "prompt").with_config(agent_config);
    world.create_agent(agent).await.unwrap();

    // A peer-agent sender (not human, not world) never resets `llm_call_count`, so a
    // second paragraph-beginning mention from the same peer pushes the counter to the
    // configured limit without another LLM call being made.
    agent_world::publish_message(&world.bus, "@a1 go", "a2", Some("c1".to_string()), None, None);
    settle().await;
    agent_world::publish_message(&world.bus, "@a1 go again", "a2", Some("c1".to_string()), None, None);
    settle().await;

    let a1 = world.agent_lock("a1").await.unwrap();
    let a1 = a1.lock().await;
    assert!(a1.memory.iter().any(|m| m.content == "turn one"));
    assert!(a1
        .memory
        .iter()
        .any(|m| m.content.contains("Turn limit reached") && m.content.contains("@human")));
}
