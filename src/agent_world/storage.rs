//! Storage abstraction (§4.10): pluggable world/agent/chat/event persistence.
//!
//! The runtime treats storage as serialisable per world and swap-in/swap-out at world-load
//! time. This module defines the `Storage` trait plus one reference implementation
//! (in-memory, used for tests and any embedding that doesn't need durability) and one
//! durable JSONL-backed implementation for callers that do.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use super::error::{WorldError, WorldResult};
use super::types::{Agent, AgentMessage, Chat, Event};

/// CRUD contract every backend must satisfy. `save_agent` is the one place the
/// every-message-has-a-messageId invariant is enforced at the storage boundary (§3, §8).
pub trait Storage: Send + Sync {
    fn save_world(&self, world_id: &str) -> WorldResult<()>;
    fn delete_world(&self, world_id: &str) -> WorldResult<()>;

    fn save_agent(&self, world_id: &str, agent: &Agent) -> WorldResult<()>;
    fn save_agents(&self, world_id: &str, agents: &[&Agent]) -> WorldResult<()> {
        for agent in agents {
            self.save_agent(world_id, agent)?;
        }
        Ok(())
    }
    fn load_agent(&self, world_id: &str, agent_id: &str) -> WorldResult<Option<Agent>>;
    fn delete_agent(&self, world_id: &str, agent_id: &str) -> WorldResult<()>;

    fn save_chat(&self, world_id: &str, chat: &Chat) -> WorldResult<()>;
    fn load_chat(&self, world_id: &str, chat_id: &str) -> WorldResult<Option<Chat>>;
    fn delete_chat(&self, world_id: &str, chat_id: &str) -> WorldResult<()>;

    fn append_event(&self, world_id: &str, event: &Event) -> WorldResult<()>;
    fn query_events(&self, world_id: &str, chat_id: Option<&str>) -> WorldResult<Vec<Event>>;

    fn query_memory(&self, world_id: &str, agent_id: &str, chat_id: Option<&str>) -> WorldResult<Vec<AgentMessage>>;
}

/// Validates the every-message-has-an-id invariant before a backend is allowed to persist.
/// Shared by both reference implementations so neither can silently accept a bad save.
fn validate_agent_memory(agent: &Agent) -> WorldResult<()> {
    let missing = agent.memory.iter().filter(|m| m.message_id.is_empty()).count();
    if missing > 0 {
        return Err(WorldError::MissingMessageIds {
            agent_id: agent.id.clone(),
            count: missing,
        });
    }
    Ok(())
}

/// In-memory reference backend: used for tests and for embeddings with no durability need.
/// Mirrors storage-as-authoritative-while-loaded from §3's ownership summary — this backend
/// simply *is* the authoritative copy, with nothing behind it.
#[derive(Default)]
pub struct InMemoryStorage {
    worlds: Mutex<Vec<String>>,
    agents: Mutex<HashMap<(String, String), Agent>>,
    chats: Mutex<HashMap<(String, String), Chat>>,
    events: Mutex<HashMap<String, Vec<Event>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_world(&self, world_id: &str) -> WorldResult<()> {
        let mut worlds = self.worlds.lock().unwrap();
        if !worlds.iter().any(|w| w == world_id) {
            worlds.push(world_id.to_string());
        }
        Ok(())
    }

    fn delete_world(&self, world_id: &str) -> WorldResult<()> {
        self.worlds.lock().unwrap().retain(|w| w != world_id);
        self.agents.lock().unwrap().retain(|(w, _), _| w != world_id);
        self.chats.lock().unwrap().retain(|(w, _), _| w != world_id);
        self.events.lock().unwrap().remove(world_id);
        Ok(())
    }

    fn save_agent(&self, world_id: &str, agent: &Agent) -> WorldResult<()> {
        validate_agent_memory(agent)?;
        self.agents
            .lock()
            .unwrap()
            .insert((world_id.to_string(), agent.id.clone()), agent.clone());
        Ok(())
    }

    fn load_agent(&self, world_id: &str, agent_id: &str) -> WorldResult<Option<Agent>> {
        let key = (world_id.to_string(), agent_id.to_string());
        Ok(self.agents.lock().unwrap().get(&key).cloned())
    }

    fn delete_agent(&self, world_id: &str, agent_id: &str) -> WorldResult<()> {
        self.agents
            .lock()
            .unwrap()
            .remove(&(world_id.to_string(), agent_id.to_string()));
        Ok(())
    }

    fn save_chat(&self, world_id: &str, chat: &Chat) -> WorldResult<()> {
        self.chats
            .lock()
            .unwrap()
            .insert((world_id.to_string(), chat.id.clone()), chat.clone());
        Ok(())
    }

    fn load_chat(&self, world_id: &str, chat_id: &str) -> WorldResult<Option<Chat>> {
        Ok(self
            .chats
            .lock()
            .unwrap()
            .get(&(world_id.to_string(), chat_id.to_string()))
            .cloned())
    }

    fn delete_chat(&self, world_id: &str, chat_id: &str) -> WorldResult<()> {
        self.chats
            .lock()
            .unwrap()
            .remove(&(world_id.to_string(), chat_id.to_string()));
        Ok(())
    }

    fn append_event(&self, world_id: &str, event: &Event) -> WorldResult<()> {
        self.events
            .lock()
            .unwrap()
            .entry(world_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn query_events(&self, world_id: &str, chat_id: Option<&str>) -> WorldResult<Vec<Event>> {
        let events = self.events.lock().unwrap();
        let all = events.get(world_id).cloned().unwrap_or_default();
        Ok(all
            .into_iter()
            .filter(|e| e.chat_id.as_deref() == chat_id)
            .collect())
    }

    fn query_memory(&self, world_id: &str, agent_id: &str, chat_id: Option<&str>) -> WorldResult<Vec<AgentMessage>> {
        let agent = self.load_agent(world_id, agent_id)?;
        Ok(agent
            .map(|a| {
                a.memory
                    .into_iter()
                    .filter(|m| m.chat_id.as_deref() == chat_id)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Durable backend: one append-only JSONL file of `Event`s per world, plus one JSON
/// snapshot file per agent (overwritten on every save — memory is small enough in practice
/// that a full-rewrite snapshot is simpler and just as correct as an event-sourced replay).
pub struct JsonlStorage {
    root: PathBuf,
}

impl JsonlStorage {
    pub fn new(root: impl Into<PathBuf>) -> WorldResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| WorldError::Storage(e.to_string()))?;
        Ok(JsonlStorage { root })
    }

    fn world_dir(&self, world_id: &str) -> PathBuf {
        self.root.join(world_id)
    }

    fn agent_path(&self, world_id: &str, agent_id: &str) -> PathBuf {
        self.world_dir(world_id).join(format!("agent-{agent_id}.json"))
    }

    fn events_path(&self, world_id: &str) -> PathBuf {
        self.world_dir(world_id).join("events.jsonl")
    }

    fn chat_path(&self, world_id: &str, chat_id: &str) -> PathBuf {
        self.world_dir(world_id).join(format!("chat-{chat_id}.json"))
    }
}

impl Storage for JsonlStorage {
    fn save_world(&self, world_id: &str) -> WorldResult<()> {
        fs::create_dir_all(self.world_dir(world_id)).map_err(|e| WorldError::Storage(e.to_string()))
    }

    fn delete_world(&self, world_id: &str) -> WorldResult<()> {
        let dir = self.world_dir(world_id);
        if dir.exists() {
            fs::remove_dir_all(dir).map_err(|e| WorldError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    fn save_agent(&self, world_id: &str, agent: &Agent) -> WorldResult<()> {
        validate_agent_memory(agent)?;
        fs::create_dir_all(self.world_dir(world_id)).map_err(|e| WorldError::Storage(e.to_string()))?;
        let json = serde_json::to_string_pretty(&AgentSnapshot::from(agent))
            .map_err(|e| WorldError::Storage(e.to_string()))?;
        fs::write(self.agent_path(world_id, &agent.id), json)
            .map_err(|e| WorldError::Storage(e.to_string()))
    }

    fn load_agent(&self, world_id: &str, agent_id: &str) -> WorldResult<Option<Agent>> {
        let path = self.agent_path(world_id, agent_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| WorldError::Storage(e.to_string()))?;
        let snapshot: AgentSnapshot =
            serde_json::from_str(&raw).map_err(|e| WorldError::Storage(e.to_string()))?;
        Ok(Some(snapshot.into_agent()))
    }

    fn delete_agent(&self, world_id: &str, agent_id: &str) -> WorldResult<()> {
        let path = self.agent_path(world_id, agent_id);
        if path.exists() {
            fs::remove_file(path).map_err(|e| WorldError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    fn save_chat(&self, world_id: &str, chat: &Chat) -> WorldResult<()> {
        fs::create_dir_all(self.world_dir(world_id)).map_err(|e| WorldError::Storage(e.to_string()))?;
        let json = serde_json::to_string_pretty(&ChatSnapshot::from(chat))
            .map_err(|e| WorldError::Storage(e.to_string()))?;
        fs::write(self.chat_path(world_id, &chat.id), json).map_err(|e| WorldError::Storage(e.to_string()))
    }

    fn load_chat(&self, world_id: &str, chat_id: &str) -> WorldResult<Option<Chat>> {
        let path = self.chat_path(world_id, chat_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| WorldError::Storage(e.to_string()))?;
        let snapshot: ChatSnapshot =
            serde_json::from_str(&raw).map_err(|e| WorldError::Storage(e.to_string()))?;
        Ok(Some(snapshot.into_chat()))
    }

    fn delete_chat(&self, world_id: &str, chat_id: &str) -> WorldResult<()> {
        let path = self.chat_path(world_id, chat_id);
        if path.exists() {
            fs::remove_file(path).map_err(|e| WorldError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    fn append_event(&self, world_id: &str, event: &Event) -> WorldResult<()> {
        fs::create_dir_all(self.world_dir(world_id)).map_err(|e| WorldError::Storage(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(world_id))
            .map_err(|e| WorldError::Storage(e.to_string()))?;
        let line = serde_json::to_string(event).map_err(|e| WorldError::Storage(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| WorldError::Storage(e.to_string()))
    }

    fn query_events(&self, world_id: &str, chat_id: Option<&str>) -> WorldResult<Vec<Event>> {
        let path = self.events_path(world_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).map_err(|e| WorldError::Storage(e.to_string()))?;
        let events: Vec<Event> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|e: &Event| e.chat_id.as_deref() == chat_id)
            .collect();
        Ok(events)
    }

    fn query_memory(&self, world_id: &str, agent_id: &str, chat_id: Option<&str>) -> WorldResult<Vec<AgentMessage>> {
        let agent = self.load_agent(world_id, agent_id)?;
        Ok(agent
            .map(|a| {
                a.memory
                    .into_iter()
                    .filter(|m| m.chat_id.as_deref() == chat_id)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct AgentSnapshot {
    id: String,
    name: String,
    system_prompt: String,
    provider: String,
    model: String,
    temperature: f32,
    turn_limit: u32,
    llm_call_count: u32,
    memory: Vec<AgentMessage>,
}

impl From<&Agent> for AgentSnapshot {
    fn from(agent: &Agent) -> Self {
        AgentSnapshot {
            id: agent.id.clone(),
            name: agent.name.clone(),
            system_prompt: agent.system_prompt.clone(),
            provider: agent.config.provider.clone(),
            model: agent.config.model.clone(),
            temperature: agent.config.temperature,
            turn_limit: agent.config.turn_limit,
            llm_call_count: agent.llm_call_count,
            memory: agent.memory.clone(),
        }
    }
}

impl AgentSnapshot {
    fn into_agent(self) -> Agent {
        use super::types::AgentConfig;
        Agent {
            id: self.id,
            name: self.name,
            system_prompt: self.system_prompt,
            config: AgentConfig {
                provider: self.provider,
                model: self.model,
                temperature: self.temperature,
                turn_limit: self.turn_limit,
            },
            llm_call_count: self.llm_call_count,
            memory: self.memory,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ChatSnapshot {
    id: String,
    name: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Chat> for ChatSnapshot {
    fn from(chat: &Chat) -> Self {
        ChatSnapshot {
            id: chat.id.clone(),
            name: chat.name.clone(),
            created_at: chat.created_at,
        }
    }
}

impl ChatSnapshot {
    fn into_chat(self) -> Chat {
        Chat {
            id: self.id,
            name: self.name,
            created_at: self.created_at,
        }
    }
}
