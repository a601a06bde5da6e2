//! Process Events
//!
//! The engine publishes a [`ProcessEvent`] after every status transition
//! and every recorded step, so external layers (websocket push, audit
//! trails, dashboards) can follow a process without polling the store.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::workflow::process::{ProcessId, ProcessStatus, WaitKind};
use crate::workflow::schema::InputSchema;

/// A single notification about a process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessEvent {
    pub process_id: ProcessId,
    pub workflow: String,

    /// Status after the transition
    pub status: ProcessStatus,

    /// Step the event concerns, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    /// Published with `waiting` events for the input-collection layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_input: Option<InputSchema>,

    /// Who is expected to supply `required_input`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitKind>,

    /// Failure message for `failed` events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent {
    pub fn new(process_id: ProcessId, workflow: impl Into<String>, status: ProcessStatus) -> Self {
        Self {
            process_id,
            workflow: workflow.into(),
            status,
            step: None,
            required_input: None,
            wait: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_required_input(mut self, schema: InputSchema, wait: WaitKind) -> Self {
        self.required_input = Some(schema);
        self.wait = Some(wait);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Receiver of process events.
///
/// Sinks are called synchronously from the thread driving the process and
/// must not block for long.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ProcessEvent);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &ProcessEvent) {
        match (&event.step, &event.error) {
            (Some(step), Some(error)) => info!(
                "Process {} [{}] {} at '{}': {}",
                event.process_id, event.workflow, event.status, step, error
            ),
            (Some(step), None) => info!(
                "Process {} [{}] {} at '{}'",
                event.process_id, event.workflow, event.status, step
            ),
            (None, _) => info!(
                "Process {} [{}] {}",
                event.process_id, event.workflow, event.status
            ),
        }
    }
}

/// Forwards events over an mpsc channel.
pub struct ChannelSink {
    sender: Mutex<Sender<ProcessEvent>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<ProcessEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &ProcessEvent) {
        let sent = match self.sender.lock() {
            Ok(sender) => sender.send(event.clone()).is_ok(),
            Err(_) => false,
        };
        if !sent {
            warn!("Dropped event for process {}: receiver gone", event.process_id);
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ProcessEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far.
    pub fn events(&self) -> Vec<ProcessEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Statuses published for one process, in order.
    pub fn statuses(&self, process_id: ProcessId) -> Vec<ProcessStatus> {
        self.events()
            .into_iter()
            .filter(|e| e.process_id == process_id)
            .map(|e| e.status)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &ProcessEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Fans events out to several sinks.
#[derive(Default, Clone)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for MultiSink {
    fn emit(&self, event: &ProcessEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
