//! Advisory lifecycle signals attached to a `Patch`.
//!
//! Nothing reads these back; they exist for the people operating the engine.

use std::{fmt::Display, sync::Mutex};

use patchworks_core::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    PatchProcessing,
    TemplateRenderFailed,
    PatchApplied,
    PatchFailed,
    PatchReverted,
    RevertFailed,
}

impl Reason {
    pub fn event_type(&self) -> EventType {
        match self {
            Reason::PatchProcessing | Reason::PatchApplied | Reason::PatchReverted => {
                EventType::Normal
            }
            Reason::TemplateRenderFailed | Reason::PatchFailed | Reason::RevertFailed => {
                EventType::Warning
            }
        }
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Reason::PatchProcessing => "PatchProcessing",
            Reason::TemplateRenderFailed => "TemplateRenderFailed",
            Reason::PatchApplied => "PatchApplied",
            Reason::PatchFailed => "PatchFailed",
            Reason::PatchReverted => "PatchReverted",
            Reason::RevertFailed => "RevertFailed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub object: ObjectKey,
    pub reason: Reason,
    pub message: String,
}

pub trait EventSink: Send + Sync {
    fn record(&self, object: &ObjectKey, reason: Reason, message: &str);
}

/// Emits events as log lines.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, object: &ObjectKey, reason: Reason, message: &str) {
        match reason.event_type() {
            EventType::Normal => {
                tracing::info!(object = %object, reason = %reason, "{}", message)
            }
            EventType::Warning => {
                tracing::warn!(object = %object, reason = %reason, "{}", message)
            }
        }
    }
}

/// Keeps events in memory, for inspection.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("mutex poisoned").clone()
    }

    pub fn reasons(&self) -> Vec<Reason> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("mutex poisoned").clear();
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, object: &ObjectKey, reason: Reason, message: &str) {
        self.events.lock().expect("mutex poisoned").push(Event {
            object: object.clone(),
            reason,
            message: message.to_string(),
        });
    }
}
