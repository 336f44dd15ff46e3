//! Event persistence (§4.8): auto-saves emitted events to storage.
//!
//! Attached by `setup_event_persistence` at world-load time. SSE chunk events are never
//! persisted — only `start`/`end` markers, with composite ids so they never collide with
//! the `messageId` UNIQUE constraint a naive implementation would otherwise hit (the
//! historical bug this section calls out by name).

use std::sync::Arc;

use async_trait::async_trait;
use log::error;
use uuid::Uuid;

use super::bus::{EventBus, EventSubscriber, Subscription};
use super::storage::Storage;
use super::types::{Event, EventPayload, SseKind};

pub struct PersistenceSubscriber {
    storage: Arc<dyn Storage>,
    world_id: String,
}

#[async_trait]
impl EventSubscriber for PersistenceSubscriber {
    async fn handle(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let persisted = match &event.payload {
            EventPayload::Message(_) => Some(event.clone()),
            EventPayload::Sse { kind, message_id, .. } => match kind {
                SseKind::Chunk => None,
                SseKind::Start => Some(event.clone().with_id(format!("{message_id}-sse-start"))),
                SseKind::End => Some(event.clone().with_id(format!("{message_id}-sse-end"))),
            },
            EventPayload::World { .. } => None,
            _ => Some(with_random_id_if_missing(event)),
        };

        if let Some(event) = persisted {
            if let Err(e) = self.storage.append_event(&self.world_id, &event) {
                error!(
                    "failed to persist event {} on world '{}': {e}",
                    event.id, self.world_id
                );
            }
        }
        Ok(())
    }
}

fn with_random_id_if_missing(event: &Event) -> Event {
    if event.id.is_empty() {
        event.clone().with_id(Uuid::new_v4().to_string())
    } else {
        event.clone()
    }
}

/// Attaches the persistence subscriber to every channel named in §4.8: `message`, `sse`,
/// `tool`, `system`, `crud`. `world` activity events are intentionally excluded — they are
/// ephemeral lifecycle markers, not conversation content, and are not part of the
/// persisted, per-chat-exportable event stream.
pub fn setup_event_persistence(
    bus: &EventBus,
    storage: Arc<dyn Storage>,
    world_id: impl Into<String>,
) -> Vec<Subscription> {
    let subscriber = Arc::new(PersistenceSubscriber {
        storage,
        world_id: world_id.into(),
    });
    bus.subscribe_to_persistence_channels(subscriber)
}
