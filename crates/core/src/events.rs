//! Notification sink: fire-and-forget events about the transfer
//! lifecycle. Emission never errors the pipeline.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::OwnerRef;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

// Reason codes attached to emitted events.
pub const EV_TRANSFER_STARTED: &str = "TransferStarted";
pub const EV_TRANSFER_FAILED: &str = "TransferFailed";
pub const EV_ENDPOINT_ADDRESS: &str = "EndpointAddress";
pub const EV_ENDPOINT_NO_ADDRESS: &str = "EndpointNoAddress";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmittedEvent {
    pub owner: String,
    /// Kind/name of the object the event is about, when there is one.
    pub object: Option<String>,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

pub trait EventSink: Send + Sync {
    fn emit(
        &self,
        owner: &OwnerRef,
        object: Option<&str>,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    );
}

/// Sink that forwards events to the tracing subscriber.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(
        &self,
        owner: &OwnerRef,
        object: Option<&str>,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) {
        match severity {
            EventSeverity::Normal => {
                info!(owner = %owner.name, object = ?object, reason = %reason, "{}", message)
            }
            EventSeverity::Warning => {
                warn!(owner = %owner.name, object = ?object, reason = %reason, "{}", message)
            }
        }
    }
}

/// Sink that records events for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<EmittedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EmittedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<EmittedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(
        &self,
        owner: &OwnerRef,
        object: Option<&str>,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) {
        let ev = EmittedEvent {
            owner: owner.name.clone(),
            object: object.map(|s| s.to_string()),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        };
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ev);
    }
}
