//! World façade: `createWorld`/`getWorld`/`deleteWorld` and the agent/chat lifecycle
//! operations layered on top of the bus, orchestrator, and storage modules.
//!
//! A `World` exclusively owns its agents, chats, event bus, and listener handles (§3).
//! Cyclic references (world ↔ agent ↔ memory ↔ event) are represented by id + lookup
//! rather than back-pointers, per the re-architecture guidance in §9.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::{Mutex, RwLock};

use super::activity::ActivityTracker;
use super::bus::{publish_crud_event, publish_event, EventBus, EventSubscriber, Subscription};
use super::config::RuntimeConfig;
use super::error::{WorldError, WorldResult};
use super::persistence::setup_event_persistence;
use super::provider::{ProviderAdapter, ToolSchema};
use super::storage::Storage;
use super::subscribers::{AgentMessageSubscriber, ToolMessageSubscriber};
use super::title::generate_title;
use super::types::{Agent, AgentConfig, Chat, Event, EventPayload, WorldActivityKind};

type ProviderResolver = dyn Fn(&AgentConfig) -> Arc<dyn ProviderAdapter> + Send + Sync;

/// The top-level container of agents, chats, events, and bus for one world (§2, §3).
pub struct World {
    pub id: String,
    pub bus: Arc<EventBus>,
    pub storage: Arc<dyn Storage>,
    pub activity: Arc<ActivityTracker>,
    pub config: RuntimeConfig,
    agents: RwLock<HashMap<String, Arc<Mutex<Agent>>>>,
    chats: RwLock<HashMap<String, Chat>>,
    current_chat_id: RwLock<Option<String>>,
    subscriptions: std::sync::Mutex<Vec<Subscription>>,
    provider_resolver: Arc<ProviderResolver>,
    tool_schemas: Vec<ToolSchema>,
}

impl World {
    fn new(
        id: impl Into<String>,
        storage: Arc<dyn Storage>,
        config: RuntimeConfig,
        provider_resolver: Arc<ProviderResolver>,
        tool_schemas: Vec<ToolSchema>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        bus.set_streaming_enabled(config.streaming_enabled);
        let activity = Arc::new(ActivityTracker::new(Arc::clone(&bus)));
        Arc::new(World {
            id: id.into(),
            bus,
            storage,
            activity,
            config,
            agents: RwLock::new(HashMap::new()),
            chats: RwLock::new(HashMap::new()),
            current_chat_id: RwLock::new(None),
            subscriptions: std::sync::Mutex::new(Vec::new()),
            provider_resolver,
            tool_schemas,
        })
    }

    /// Attaches the world-level listeners (§4.2 activity/title listener, §4.8 persistence).
    /// Called once by `WorldRegistry::get_world`/`create_world` — listeners are detached by
    /// `delete_world`.
    fn attach_listeners(self: &Arc<Self>) {
        let mut subscriptions = setup_event_persistence(
            &self.bus,
            Arc::clone(&self.storage),
            self.id.clone(),
        );
        let title_subscriber: Arc<dyn EventSubscriber> = Arc::new(ActivityTitleSubscriber {
            world: Arc::downgrade(self),
        });
        subscriptions.push(self.bus.subscribe_to_world(title_subscriber));
        *self.subscriptions.lock().unwrap() = subscriptions;
    }

    fn detach_listeners(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().unwrap());
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    }

    /// Registers a new agent, attaching its two per-agent subscribers (§4.2) to the
    /// `message` channel.
    pub async fn create_agent(self: &Arc<Self>, agent: Agent) -> WorldResult<()> {
        let agent_id = agent.id.clone();
        self.storage.save_agent(&self.id, &agent)?;
        self.agents
            .write()
            .await
            .insert(agent_id.clone(), Arc::new(Mutex::new(agent)));

        let agent_sub: Arc<dyn EventSubscriber> = Arc::new(AgentMessageSubscriber {
            world: Arc::downgrade(self),
            agent_id: agent_id.clone(),
        });
        let tool_sub: Arc<dyn EventSubscriber> = Arc::new(ToolMessageSubscriber {
            world: Arc::downgrade(self),
            agent_id: agent_id.clone(),
        });
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.push(self.bus.subscribe_to_messages(agent_sub));
        subscriptions.push(self.bus.subscribe_to_messages(tool_sub));
        drop(subscriptions);

        publish_crud_event(&self.bus, "agent", "create", self.current_chat_id_sync());
        Ok(())
    }

    pub async fn agent_lock(&self, agent_id: &str) -> Option<Arc<Mutex<Agent>>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    pub async fn create_chat(&self, chat_id: impl Into<String>) -> WorldResult<Chat> {
        let chat = Chat::new(chat_id);
        self.storage.save_chat(&self.id, &chat)?;
        self.chats.write().await.insert(chat.id.clone(), chat.clone());
        publish_crud_event(&self.bus, "chat", "create", Some(chat.id.clone()));
        Ok(chat)
    }

    pub async fn delete_chat(&self, chat_id: &str) -> WorldResult<()> {
        self.storage.delete_chat(&self.id, chat_id)?;
        self.chats.write().await.remove(chat_id);
        {
            let mut current = self.current_chat_id.write().await;
            if current.as_deref() == Some(chat_id) {
                *current = None;
            }
        }
        // Cascade: drop this chat's messages from every agent's in-memory view. Storage's
        // own copy is left to the backend's own deletion semantics (§3's "storage owns
        // on-disk copies" split).
        for agent_lock in self.agents.read().await.values() {
            let mut agent = agent_lock.lock().await;
            agent.memory.retain(|m| m.chat_id.as_deref() != Some(chat_id));
        }
        publish_crud_event(&self.bus, "chat", "delete", Some(chat_id.to_string()));
        Ok(())
    }

    pub async fn set_current_chat(&self, chat_id: Option<String>) {
        *self.current_chat_id.write().await = chat_id;
    }

    pub async fn current_chat_id_async(&self) -> Option<String> {
        self.current_chat_id.read().await.clone()
    }

    /// Synchronous best-effort read used only from non-async call sites (agent
    /// registration); falls back to `None` if the lock is momentarily contended rather than
    /// blocking a sync caller.
    fn current_chat_id_sync(&self) -> Option<String> {
        self.current_chat_id.try_read().ok().and_then(|g| g.clone())
    }

    pub fn current_chat_id(&self) -> Option<String> {
        self.current_chat_id_sync()
    }

    /// Builds the per-call orchestrator context for `agent`, resolving its provider adapter
    /// from the world's configured resolver.
    pub async fn orchestrator_context(&self, agent: &Agent) -> super::orchestrator::OrchestratorContext {
        super::orchestrator::OrchestratorContext {
            bus: Arc::clone(&self.bus),
            provider: (self.provider_resolver)(&agent.config),
            tool_schemas: self.tool_schemas.clone(),
            activity: Arc::clone(&self.activity),
            config: self.config.clone(),
        }
    }
}

/// World-level activity listener (§4.2): on `idle`, generates a chat title from
/// accumulated messages iff the current chat's name is still `"New Chat"`. `ActivityTracker`
/// already guarantees at most one `Idle` event per begin/complete nesting, so at most one
/// `chat-title-updated` event follows per conversation turn regardless of agent count.
struct ActivityTitleSubscriber {
    world: Weak<World>,
}

#[async_trait]
impl EventSubscriber for ActivityTitleSubscriber {
    async fn handle(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let world = match self.world.upgrade() {
            Some(w) => w,
            None => return Ok(()),
        };
        let is_idle = matches!(&event.payload, EventPayload::World { kind: WorldActivityKind::Idle, .. });
        if !is_idle {
            return Ok(());
        }

        let chat_id = match world.current_chat_id_async().await {
            Some(id) => id,
            None => return Ok(()),
        };
        let mut chats = world.chats.write().await;
        let chat = match chats.get_mut(&chat_id) {
            Some(chat) if chat.is_untitled() => chat,
            _ => return Ok(()),
        };

        let mut accumulated = Vec::new();
        for agent_lock in world.agents.read().await.values() {
            let agent = agent_lock.lock().await;
            accumulated.extend(
                agent
                    .memory
                    .iter()
                    .filter(|m| m.chat_id.as_deref() == Some(chat_id.as_str()))
                    .cloned(),
            );
        }
        accumulated.sort_by_key(|m| m.created_at);

        let title = generate_title(&accumulated);
        if title == "New Chat" {
            return Ok(());
        }
        chat.name = title.clone();
        if let Err(e) = world.storage.save_chat(&world.id, chat) {
            error!("failed to persist generated title for chat '{chat_id}': {e}");
        }
        info!("chat '{chat_id}' title set to '{title}'");
        publish_event(&world.bus, "chat-title-updated", Some(chat_id));
        Ok(())
    }
}

/// Process-wide registry implementing `createWorld`/`getWorld`/`deleteWorld` (§2).
#[derive(Default)]
pub struct WorldRegistry {
    worlds: std::sync::Mutex<HashMap<String, Arc<World>>>,
}

impl WorldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a world, attaches its listeners, and registers it. Returns the same `Arc`
    /// that `get_world` will hand back for the rest of the process's lifetime.
    pub fn create_world(
        &self,
        id: impl Into<String>,
        storage: Arc<dyn Storage>,
        config: RuntimeConfig,
        provider_resolver: Arc<ProviderResolver>,
        tool_schemas: Vec<ToolSchema>,
    ) -> WorldResult<Arc<World>> {
        let id = id.into();
        storage.save_world(&id)?;
        let world = World::new(id.clone(), storage, config, provider_resolver, tool_schemas);
        world.attach_listeners();
        self.worlds.lock().unwrap().insert(id, Arc::clone(&world));
        Ok(world)
    }

    /// Loads a previously created world, attaching listeners if this is the first time this
    /// process has seen it. In this in-process registry, a world always already has its
    /// listeners attached once created, so this simply returns the live instance.
    pub fn get_world(&self, id: &str) -> Option<Arc<World>> {
        self.worlds.lock().unwrap().get(id).cloned()
    }

    /// Detaches listeners, removes all chats/agents, and drops the world from the registry.
    pub fn delete_world(&self, id: &str) -> WorldResult<()> {
        let world = self
            .worlds
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| WorldError::WorldNotFound(id.to_string()))?;
        world.detach_listeners();
        world.storage.delete_world(id)?;
        Ok(())
    }
}
