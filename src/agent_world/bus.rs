//! In-process publish/subscribe event bus with named, chat-scoped channels.
//!
//! Backed by `tokio::sync::broadcast`, one channel per named stream (`message`, `sse`,
//! `tool`, `world`, `system`, `crud`). Every event is a plain, cloneable value
//! (`Event`/`EventPayload` in `types.rs`); handlers receive a borrow and must not mutate it.
//!
//! The historically-observed bug this module guards against: an async subscriber whose
//! future silently drops an error or panics mid-poll, which previously meant agent handlers
//! stopped responding with no trace in the logs. `subscribe_to_messages` /
//! `subscribe_to_sse` both wrap delivery in a supervised task that logs — never
//! propagates — both synchronous panics and returned errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::types::{
    is_human_sender, AgentMessage, ApprovalDecision, Event, EventPayload, EventType, ParsedMessageContent,
    Role, SseKind, ToolResultEnvelope, WorldActivityKind,
};

/// Inputs for `publish_tool_result`, mirroring the one sanctioned approval-response shape.
pub struct ToolResultRequest {
    pub tool_call_id: String,
    pub decision: ApprovalDecision,
    pub scope: Option<super::types::ApprovalScope>,
    pub tool_name: String,
    pub tool_args: Option<serde_json::Value>,
    pub working_directory: Option<String>,
}

/// Default ring-buffer capacity per channel. Slow subscribers that fall behind this many
/// events see `RecvError::Lagged` and skip forward; the bus does not block publishers.
const CHANNEL_CAPACITY: usize = 1024;

/// Implemented by anything that wants to observe events on the `message` or `sse` channel.
/// A handler may be sync or return a future: in Rust
/// every handler is async, and a non-async handler is just one whose body never awaits.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A live subscription; dropping or calling `unsubscribe` detaches the listener task.
pub struct Subscription {
    task: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

/// The world's in-process bus: six named broadcast channels plus the process-wide
/// streaming-enabled flag that gates `sse` chunk emission.
pub struct EventBus {
    message: broadcast::Sender<Event>,
    sse: broadcast::Sender<Event>,
    tool: broadcast::Sender<Event>,
    world: broadcast::Sender<Event>,
    system: broadcast::Sender<Event>,
    crud: broadcast::Sender<Event>,
    streaming_enabled: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            message: broadcast::channel(CHANNEL_CAPACITY).0,
            sse: broadcast::channel(CHANNEL_CAPACITY).0,
            tool: broadcast::channel(CHANNEL_CAPACITY).0,
            world: broadcast::channel(CHANNEL_CAPACITY).0,
            system: broadcast::channel(CHANNEL_CAPACITY).0,
            crud: broadcast::channel(CHANNEL_CAPACITY).0,
            streaming_enabled: AtomicBool::new(true),
        }
    }

    pub fn set_streaming_enabled(&self, enabled: bool) {
        self.streaming_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn streaming_enabled(&self) -> bool {
        self.streaming_enabled.load(Ordering::SeqCst)
    }

    fn sender_for(&self, event_type: EventType) -> &broadcast::Sender<Event> {
        match event_type {
            EventType::Message => &self.message,
            EventType::Sse => &self.sse,
            EventType::Tool => &self.tool,
            EventType::World => &self.world,
            EventType::System => &self.system,
            EventType::Crud => &self.crud,
        }
    }

    /// Emits an event on its channel. Broadcasting never fails even if every subscriber
    /// has since been dropped — the only error `broadcast::Sender::send` returns is
    /// "no receivers", which is not a failure from the publisher's point of view.
    pub fn emit(&self, event: Event) {
        // `sse` chunk suppression is enforced by the sse publisher before this is called,
        // not here, so every other channel's emit stays unconditional.
        let _ = self.sender_for(event.event_type).send(event);
    }

    /// Attaches a supervised listener to the `message` channel. Each delivered event runs
    /// in its own spawned task so one subscriber's panic or slow handler never blocks, or
    /// is blocked by, another's.
    pub fn subscribe_to_messages(&self, subscriber: Arc<dyn EventSubscriber>) -> Subscription {
        self.subscribe_channel(self.message.subscribe(), subscriber, "message")
    }

    /// Attaches a supervised listener to the `sse` channel.
    pub fn subscribe_to_sse(&self, subscriber: Arc<dyn EventSubscriber>) -> Subscription {
        self.subscribe_channel(self.sse.subscribe(), subscriber, "sse")
    }

    /// Attaches a supervised listener to the `world` channel (used by the activity tracker).
    pub fn subscribe_to_world(&self, subscriber: Arc<dyn EventSubscriber>) -> Subscription {
        self.subscribe_channel(self.world.subscribe(), subscriber, "world")
    }

    /// Attaches a supervised listener to the `tool` channel.
    pub fn subscribe_to_tool(&self, subscriber: Arc<dyn EventSubscriber>) -> Subscription {
        self.subscribe_channel(self.tool.subscribe(), subscriber, "tool")
    }

    /// Attaches a supervised listener to the `system` channel.
    pub fn subscribe_to_system(&self, subscriber: Arc<dyn EventSubscriber>) -> Subscription {
        self.subscribe_channel(self.system.subscribe(), subscriber, "system")
    }

    /// Attaches a supervised listener to the `crud` channel.
    pub fn subscribe_to_crud(&self, subscriber: Arc<dyn EventSubscriber>) -> Subscription {
        self.subscribe_channel(self.crud.subscribe(), subscriber, "crud")
    }

    /// Multi-channel subscription used by `setup_event_persistence` (§4.8), which listens
    /// to `message`, `sse`, `tool`, `system`, and `crud` with one handler.
    pub fn subscribe_to_persistence_channels(
        &self,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Vec<Subscription> {
        vec![
            self.subscribe_to_messages(Arc::clone(&subscriber)),
            self.subscribe_to_sse(Arc::clone(&subscriber)),
            self.subscribe_to_tool(Arc::clone(&subscriber)),
            self.subscribe_to_system(Arc::clone(&subscriber)),
            self.subscribe_to_crud(subscriber),
        ]
    }

    fn subscribe_channel(
        &self,
        mut receiver: broadcast::Receiver<Event>,
        subscriber: Arc<dyn EventSubscriber>,
        channel_name: &'static str,
    ) -> Subscription {
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => dispatch_one(Arc::clone(&subscriber), event, channel_name).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!(
                            "bus channel '{channel_name}' subscriber lagged, skipped {skipped} events"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one subscriber invocation inside a supervised task so a panic is caught and logged
/// rather than unwinding into the dispatch loop (which would silently kill the listener for
/// every later event on that channel — the historically observed failure mode).
async fn dispatch_one(subscriber: Arc<dyn EventSubscriber>, event: Event, channel_name: &'static str) {
    let event_id = event.id.clone();
    let handle = tokio::spawn(async move { subscriber.handle(&event).await });
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            log::error!(
                "bus handler on channel '{channel_name}' failed for event {event_id}: {error}"
            );
        }
        Err(join_error) => {
            log::error!(
                "bus handler on channel '{channel_name}' panicked for event {event_id}: {join_error}"
            );
        }
    }
}

/// `publishMessage`: resolves role from content/sender, stamps `chatId`, generates a
/// `messageId` when absent, emits on `message`, and returns the constructed event.
/// Never fails on emission — a full mailbox is a dropped slow-subscriber concern, not a
/// publisher error.
pub fn publish_message(
    bus: &EventBus,
    content: &str,
    sender: &str,
    chat_id: Option<String>,
    message_id: Option<String>,
    reply_to_message_id: Option<String>,
) -> Event {
    let parsed = super::types::parse_message_content(content, sender);
    let (role, text) = match parsed {
        ParsedMessageContent::ToolResult(_) => (Role::Tool, content.to_string()),
        ParsedMessageContent::Plain { role, text } => (role, text),
    };

    let mut message = AgentMessage::new(role, text).with_sender(sender);
    if let Some(id) = message_id {
        message = message.with_message_id(id);
    }
    if let Some(reply_to) = reply_to_message_id {
        message = message.with_reply_to(reply_to);
    }
    if let Some(chat_id) = chat_id.clone() {
        message = message.with_chat_id(chat_id);
    }
    if role == Role::Tool {
        if let ParsedMessageContent::ToolResult(envelope) =
            super::types::parse_message_content(content, sender)
        {
            message = message.with_tool_call_id(envelope.tool_call_id);
        }
    }

    let mut event = Event::new(EventType::Message, EventPayload::Message(message.clone()))
        .with_id(message.message_id.clone())
        .with_sender(sender)
        .with_content(message.content.clone());
    if let Some(chat_id) = chat_id {
        event = event.with_chat_id(chat_id);
    }
    bus.emit(event.clone());
    event
}

/// `publishToolResult`: the only sanctioned way to produce a `role: tool` message. Wraps
/// the request in the enhanced envelope and delegates to `publish_message` with
/// `sender = "human"`.
pub fn publish_tool_result(
    bus: &EventBus,
    chat_id: Option<String>,
    request: ToolResultRequest,
) -> Event {
    let mut envelope = ToolResultEnvelope::new(
        request.tool_call_id.clone(),
        request.decision,
        request.tool_name,
    );
    if let Some(scope) = request.scope {
        envelope = envelope.with_scope(scope);
    }
    if let Some(args) = request.tool_args {
        envelope = envelope.with_tool_args(args);
    }
    if let Some(dir) = request.working_directory {
        envelope = envelope.with_working_directory(dir);
    }
    let content = serde_json::to_string(&envelope).expect("envelope always serialises");
    publish_message(bus, &content, "human", chat_id, None, None)
}

/// `publishSSE`: one lifecycle slice of a streamed response. Chunk emission is gated by the
/// bus's process-wide streaming flag; start/end always emit regardless, since they carry
/// persistence-relevant lifecycle boundaries rather than high-frequency payload.
pub fn publish_sse(
    bus: &EventBus,
    agent_name: &str,
    kind: SseKind,
    message_id: &str,
    content: Option<String>,
    usage: Option<super::types::TokenUsage>,
    chat_id: Option<String>,
) -> Option<Event> {
    if kind == SseKind::Chunk && !bus.streaming_enabled() {
        return None;
    }
    let mut event = Event::new(
        EventType::Sse,
        EventPayload::Sse {
            kind,
            message_id: message_id.to_string(),
            content,
            usage,
        },
    )
    .with_sender(agent_name);
    if let Some(chat_id) = chat_id {
        event = event.with_chat_id(chat_id);
    }
    bus.emit(event.clone());
    Some(event)
}

/// `publishToolEvent`: single-payload emitter for tool-lifecycle notices that are not
/// themselves the sanctioned tool-result message (e.g. execution progress notices).
pub fn publish_tool_event(bus: &EventBus, text: &str, chat_id: Option<String>) -> Event {
    let mut event = Event::new(EventType::Tool, EventPayload::Tool { text: text.to_string() });
    if let Some(chat_id) = chat_id {
        event = event.with_chat_id(chat_id);
    }
    bus.emit(event.clone());
    event
}

/// `publishCRUDEvent`: notifies subscribers of a create/update/delete on a top-level entity.
pub fn publish_crud_event(bus: &EventBus, entity: &str, action: &str, chat_id: Option<String>) -> Event {
    let mut event = Event::new(
        EventType::Crud,
        EventPayload::Crud {
            entity: entity.to_string(),
            action: action.to_string(),
        },
    );
    if let Some(chat_id) = chat_id {
        event = event.with_chat_id(chat_id);
    }
    bus.emit(event.clone());
    event
}

/// `publishEvent`: generic system-channel emitter, used for activity lifecycle markers and
/// free-standing system notices (e.g. the `chat-title-updated` marker).
pub fn publish_event(bus: &EventBus, text: &str, chat_id: Option<String>) -> Event {
    let mut event = Event::new(EventType::System, EventPayload::System { text: text.to_string() });
    if let Some(chat_id) = chat_id {
        event = event.with_chat_id(chat_id);
    }
    bus.emit(event.clone());
    event
}

/// Publishes a world-activity lifecycle event (`response-start` / `response-end` / `idle`).
pub fn publish_world_activity(
    bus: &EventBus,
    kind: WorldActivityKind,
    pending_operations: u32,
    reason: Option<String>,
) -> Event {
    let event = Event::new(
        EventType::World,
        EventPayload::World {
            pending_operations,
            kind,
            reason,
        },
    );
    bus.emit(event.clone());
    event
}

/// Re-export of the human-sender predicate used by routing/respond-decision logic that also
/// needs to distinguish human-origin messages without re-parsing content.
pub fn sender_is_human(sender: &str) -> bool {
    is_human_sender(sender)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_world::types::EventPayload;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingSubscriber {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventSubscriber for CountingSubscriber {
        async fn handle(&self, _event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickingSubscriber;

    #[async_trait]
    impl EventSubscriber for PanickingSubscriber {
        async fn handle(&self, _event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            panic!("boom");
        }
    }

    fn sample_event() -> Event {
        Event::new(EventType::Message, EventPayload::System { text: "hi".to_string() })
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _sub = bus.subscribe_to_messages(Arc::new(CountingSubscriber { count: Arc::clone(&count) }));
        bus.emit(sample_event());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_kill_the_channel() {
        let bus = EventBus::new();
        let _panicking = bus.subscribe_to_messages(Arc::new(PanickingSubscriber));
        let count = Arc::new(AtomicUsize::new(0));
        let _counting = bus.subscribe_to_messages(Arc::new(CountingSubscriber { count: Arc::clone(&count) }));
        bus.emit(sample_event());
        bus.emit(sample_event());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn streaming_enabled_defaults_to_true() {
        let bus = EventBus::new();
        assert!(bus.streaming_enabled());
        bus.set_streaming_enabled(false);
        assert!(!bus.streaming_enabled());
    }

    #[test]
    fn publish_message_infers_role_from_sender() {
        let bus = EventBus::new();
        let event = publish_message(&bus, "hi everyone", "HUMAN", Some("c1".to_string()), None, None);
        match event.payload {
            EventPayload::Message(msg) => {
                assert_eq!(msg.role, Role::User);
                assert_eq!(msg.chat_id.as_deref(), Some("c1"));
                assert!(!msg.message_id.is_empty());
            }
            _ => panic!("expected message payload"),
        }
    }

    #[test]
    fn publish_tool_result_produces_tool_role_message() {
        let bus = EventBus::new();
        let event = publish_tool_result(
            &bus,
            None,
            ToolResultRequest {
                tool_call_id: "call-1".to_string(),
                decision: ApprovalDecision::Approve,
                scope: Some(super::super::types::ApprovalScope::Once),
                tool_name: "shell_cmd".to_string(),
                tool_args: None,
                working_directory: None,
            },
        );
        match event.payload {
            EventPayload::Message(msg) => {
                assert_eq!(msg.role, Role::Tool);
                assert_eq!(msg.tool_call_id.as_deref(), Some("call-1"));
            }
            _ => panic!("expected message payload"),
        }
    }

    #[test]
    fn sse_chunk_suppressed_when_streaming_disabled() {
        let bus = EventBus::new();
        bus.set_streaming_enabled(false);
        let emitted = publish_sse(&bus, "a1", SseKind::Chunk, "msg-1", Some("tok".to_string()), None, None);
        assert!(emitted.is_none());
        let start = publish_sse(&bus, "a1", SseKind::Start, "msg-1", None, None, None);
        assert!(start.is_some());
    }
}
