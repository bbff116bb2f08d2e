use serde::Serialize;
use std::collections::VecDeque;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Decision,
    Pump,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Recent events, optionally forwarded to an async consumer.  Nothing is
/// persisted.
pub struct EventLog {
    events: VecDeque<Event>,
    forward: Option<UnboundedSender<Event>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
            forward: None,
        }
    }

    /// Also send every event to `tx`.
    pub fn with_forward(tx: UnboundedSender<Event>) -> Self {
        Self {
            forward: Some(tx),
            ..Self::new()
        }
    }

    /// Newest first.
    pub fn recent(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn record_reading(&mut self, detail: String) {
        self.push(EventKind::Reading, detail);
    }

    pub fn record_decision(&mut self, detail: String) {
        self.push(EventKind::Decision, detail);
    }

    pub fn record_pump(&mut self, detail: String) {
        self.push(EventKind::Pump, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push(EventKind::System, detail);
    }

    fn push(&mut self, kind: EventKind, detail: String) {
        let event = Event {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        };

        if let Some(tx) = &self.forward {
            if tx.send(event.clone()).is_err() {
                tracing::warn!("event consumer gone, no longer forwarding");
                self.forward = None;
            }
        }

        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
