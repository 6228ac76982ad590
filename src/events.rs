//! In-process pub/sub between the capture core and its consumers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::{Category, Record};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CaptureEvent {
    /// A trigger was typed and a capture session started.
    TriggerDetected { pattern: String },
    /// A capture was classified and handed to the store.
    #[serde(rename_all = "camelCase")]
    CaptureFinished {
        content: String,
        trigger_used: String,
        category: Category,
    },
    /// A timer trigger finished; no record is created.
    #[serde(rename_all = "camelCase")]
    TimerCaptureFinished {
        event_name: String,
        trigger_used: String,
    },
    /// A record was persisted and is ready for enrichment.
    EntryCreated { record: Record },
}

/// Fire-and-forget: emitting with nobody listening is fine.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CaptureEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: CaptureEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
