use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{sleep_until, Duration, Instant},
};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// no client activity for the session timeout
    Idle,
    /// a smart_delay node
    Delay,
    /// an external call that has not answered
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub conversation_id: String,
    pub kind: TimerKind,
    pub generation: u64,
}

struct Scheduled {
    generation: u64,
    handle: JoinHandle<()>,
}

/// At most one pending timer per (conversation, kind). Rescheduling aborts
/// the previous timer and bumps the generation; a fired event only counts
/// while its generation is still the registered one.
pub struct Scheduler {
    generation: AtomicU64,
    timers: DashMap<(String, TimerKind), Scheduled>,
    tx: UnboundedSender<TimerEvent>,
}

impl Scheduler {
    pub fn new() -> (Self, UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            generation: AtomicU64::new(0),
            timers: DashMap::new(),
            tx,
        };
        (scheduler, rx)
    }

    pub fn schedule(&self, conversation_id: &str, kind: TimerKind, delay: Duration) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let event = TimerEvent {
            conversation_id: conversation_id.to_string(),
            kind,
            generation,
        };
        let deadline = Instant::now() + delay;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            let _ = tx.send(event);
        });
        let key = (conversation_id.to_string(), kind);
        if let Some(previous) = self.timers.insert(key, Scheduled { generation, handle }) {
            previous.handle.abort();
        }
        trace!(conversation = conversation_id, ?kind, generation, ?delay, "timer scheduled");
        generation
    }

    pub fn cancel(&self, conversation_id: &str, kind: TimerKind) {
        if let Some((_, t)) = self.timers.remove(&(conversation_id.to_string(), kind)) {
            t.handle.abort();
        }
    }

    pub fn cancel_all(&self, conversation_id: &str) {
        for kind in [TimerKind::Idle, TimerKind::Delay, TimerKind::External] {
            self.cancel(conversation_id, kind);
        }
    }

    pub fn generation(&self, conversation_id: &str, kind: TimerKind) -> Option<u64> {
        self.timers
            .get(&(conversation_id.to_string(), kind))
            .map(|t| t.generation)
    }

    /// Accept a fired event if it is still current, clearing the slot.
    /// Call with the conversation lock held.
    pub fn fired(&self, event: &TimerEvent) -> bool {
        self.timers
            .remove_if(&(event.conversation_id.clone(), event.kind), |_, t| {
                t.generation == event.generation
            })
            .is_some()
    }
}
