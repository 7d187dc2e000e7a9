//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Structured event sinks.
//!
//! Components report lifecycle events through an injected [`EventSink`] instead of
//! logging globally, so the same code path can feed `tracing` in production and an
//! in-memory recorder in tests.

use parking_lot::Mutex;
use tracing::Level;

/// Structured logging context attached to every emitted event.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Building identifier associated with the event.
    pub building: Option<&'a str>,
    /// Zone identifier associated with the event.
    pub zone: Option<&'a str>,
    /// Metric (measurement) name.
    pub metric: Option<&'a str>,
    /// Request path that produced the event (`range`, `latest`, `write`, `health`).
    pub path: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a building identifier.
    pub fn with_building(mut self, building: &'a str) -> Self {
        self.building = Some(building);
        self
    }

    /// Attach a zone identifier.
    pub fn with_zone(mut self, zone: &'a str) -> Self {
        self.zone = Some(zone);
        self
    }

    /// Attach a metric name.
    pub fn with_metric(mut self, metric: &'a str) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Attach the request path.
    pub fn with_path(mut self, path: &'a str) -> Self {
        self.path = Some(path);
        self
    }
}

/// High-level outcome used when emitting lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed with real data.
    Success,
    /// The operation completed, but only by falling back to a degraded answer.
    Degraded,
    /// The operation failed.
    Fault,
}

impl SystemEventOutcome {
    /// Static label used in structured fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Degraded => "degraded",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Destination for structured lifecycle events.
pub trait EventSink: Send + Sync {
    /// Record one event.
    fn record(
        &self,
        context: &LogContext<'_>,
        event: &str,
        message: &str,
        outcome: SystemEventOutcome,
    );
}

/// Sink forwarding every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(
        &self,
        context: &LogContext<'_>,
        event: &str,
        message: &str,
        outcome: SystemEventOutcome,
    ) {
        log_system_event(Some(context), event, message, outcome);
    }
}

/// Emit a standardized system event through `tracing`.
pub fn log_system_event(
    context: Option<&LogContext<'_>>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    macro_rules! emit {
        ($level:expr) => {
            tracing::event!(
                $level,
                event,
                outcome = outcome.as_str(),
                building = ctx.building.unwrap_or(""),
                zone = ctx.zone.unwrap_or(""),
                metric = ctx.metric.unwrap_or(""),
                path = ctx.path.unwrap_or(""),
                message = %message
            )
        };
    }
    match outcome {
        SystemEventOutcome::Success => emit!(Level::INFO),
        SystemEventOutcome::Degraded => emit!(Level::WARN),
        SystemEventOutcome::Fault => emit!(Level::ERROR),
    }
}

/// Owned copy of an event captured by [`MemoryEventSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Event name, e.g. `timeseries.fallback`.
    pub event: String,
    /// Human readable message.
    pub message: String,
    /// Reported outcome.
    pub outcome: SystemEventOutcome,
    /// Building from the context.
    pub building: Option<String>,
    /// Zone from the context.
    pub zone: Option<String>,
    /// Metric from the context.
    pub metric: Option<String>,
    /// Request path from the context.
    pub path: Option<String>,
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventSink {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events, in emission order.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Recorded events with the given name.
    pub fn named(&self, event: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|recorded| recorded.event == event)
            .cloned()
            .collect()
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn record(
        &self,
        context: &LogContext<'_>,
        event: &str,
        message: &str,
        outcome: SystemEventOutcome,
    ) {
        self.events.lock().push(RecordedEvent {
            event: event.to_owned(),
            message: message.to_owned(),
            outcome,
            building: context.building.map(str::to_owned),
            zone: context.zone.map(str::to_owned),
            metric: context.metric.map(str::to_owned),
            path: context.path.map(str::to_owned),
        });
    }
}
