//! Typed event feed of a simulation run
//!
//! The controller produces a typed event stream; consumers subscribe and
//! unsubscribe freely. Dropping a receiver never affects the run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use protocol_emitter::{DeliveryReport, OutboundUpdate};

/// Capacity of the broadcast channel backing the feed
pub const FEED_CAPACITY: usize = 1024;

/// Counter snapshot carried by progress events
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub updates_processed: i64,
    pub updates_requested: i64,
    pub delayed_update_requests: i64,
    pub error_update_requests: i64,
    /// Wall-clock milliseconds since the run started
    pub elapsed_time_ms: i64,
    /// Simulation-clock milliseconds since the run started
    pub simulated_elapsed_time_ms: i64,
}

/// Events emitted by a simulation run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SimulationEvent {
    TokenRequest,
    TokenResponse { expires_at: DateTime<Utc> },
    TokenRequestScheduled { scheduled_at: DateTime<Utc> },
    UpdateScheduled { job: String, schedule: String, element: Value, attributes: Vec<String> },
    UpdateRequest { request: OutboundUpdate },
    UpdateResponse { request: OutboundUpdate, response: DeliveryReport },
    Error { error: String, #[serde(skip_serializing_if = "Option::is_none")] request: Option<OutboundUpdate> },
    ProgressInfo(ProgressSnapshot),
    Stop,
    End,
}

impl SimulationEvent {
    /// The event name as it appears on the feed
    pub fn name(&self) -> &'static str {
        match self {
            SimulationEvent::TokenRequest => "token-request",
            SimulationEvent::TokenResponse { .. } => "token-response",
            SimulationEvent::TokenRequestScheduled { .. } => "token-request-scheduled",
            SimulationEvent::UpdateScheduled { .. } => "update-scheduled",
            SimulationEvent::UpdateRequest { .. } => "update-request",
            SimulationEvent::UpdateResponse { .. } => "update-response",
            SimulationEvent::Error { .. } => "error",
            SimulationEvent::ProgressInfo(_) => "progress-info",
            SimulationEvent::Stop => "stop",
            SimulationEvent::End => "end",
        }
    }
}

/// Broadcast handle for the event feed
#[derive(Clone)]
pub struct EventFeed {
    sender: broadcast::Sender<SimulationEvent>,
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFeed {
    /// Create a feed with the default capacity
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender }
    }

    /// Subscribe to events from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<SimulationEvent> {
        self.sender.subscribe()
    }

    /// Emit an event; a feed without subscribers drops it silently
    pub fn emit(&self, event: SimulationEvent) {
        tracing::debug!(event = event.name(), "feed event");
        let _ = self.sender.send(event);
    }
}
