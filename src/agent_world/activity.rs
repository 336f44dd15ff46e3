//! World activity tracker: paired begin/complete tokens over a monotonic counter.
//!
//! On increment from 0 emits `response-start`; on any decrement with work still pending
//! emits `response-end`; on decrement to 0 emits `idle`. The orchestrator wraps each
//! `processAgentMessage` invocation in one begin/complete pair (§4.6), and `idle` is the
//! sole trigger for chat-title generation — guaranteeing exactly one title update per
//! conversation turn no matter how many agents were active.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::bus::{publish_world_activity, EventBus};
use super::types::WorldActivityKind;

/// Tracks in-flight agent orchestrations for one world.
pub struct ActivityTracker {
    pending: AtomicU32,
    bus: Arc<EventBus>,
}

impl ActivityTracker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        ActivityTracker {
            pending: AtomicU32::new(0),
            bus,
        }
    }

    pub fn pending_operations(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Begins one unit of work, returning a guard that completes it on drop (or explicit
    /// `complete()`) rather than exposing raw increment/decrement to callers.
    pub fn begin(self: &Arc<Self>, reason: impl Into<String>) -> ActivityToken {
        let previous = self.pending.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            publish_world_activity(&self.bus, WorldActivityKind::ResponseStart, 1, Some(reason.into()));
        }
        ActivityToken {
            tracker: Arc::clone(self),
            completed: false,
        }
    }

    fn complete(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::SeqCst);
        let remaining = previous.saturating_sub(1);
        if remaining > 0 {
            publish_world_activity(&self.bus, WorldActivityKind::ResponseEnd, remaining, None);
        } else {
            publish_world_activity(&self.bus, WorldActivityKind::Idle, 0, None);
        }
    }
}

/// RAII guard for one unit of tracked activity. Calling `complete()` is idempotent;
/// dropping an uncomplete token completes it, so a panicking orchestration still reaches
/// `idle` rather than wedging the world's activity counter forever.
pub struct ActivityToken {
    tracker: Arc<ActivityTracker>,
    completed: bool,
}

impl ActivityToken {
    pub fn complete(mut self) {
        self.tracker.complete();
        self.completed = true;
    }
}

impl Drop for ActivityToken {
    fn drop(&mut self) {
        if !self.completed {
            self.tracker.complete();
        }
    }
}
