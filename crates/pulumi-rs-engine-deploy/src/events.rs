use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pulumi_rs_engine_resource::{ResourceState, Urn};

use crate::diag::Diagnostic;
use crate::step::{Step, StepOp};

/// Metadata describing a step, attached to step lifecycle events.
#[derive(Debug, Clone)]
pub struct StepEventMetadata {
    pub op: StepOp,
    pub urn: Urn,
    pub type_token: String,
    pub old: Option<Arc<ResourceState>>,
    pub new: Option<Arc<ResourceState>>,
    pub keys: Vec<String>,
    pub provider: String,
}

impl StepEventMetadata {
    pub fn from_step(step: &Step) -> Self {
        Self {
            op: step.op,
            urn: step.urn.clone(),
            type_token: step.type_token().to_string(),
            old: step.old.clone(),
            new: step.new.clone(),
            keys: step.keys.clone(),
            provider: step.provider.clone(),
        }
    }
}

/// Counts of steps by outcome, attached to the summary event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// An event on the engine's ordered stream to external subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The operation is starting.
    Prelude { dry_run: bool },
    /// A step is about to execute.
    ResourcePre(StepEventMetadata),
    /// A step completed and produced outputs.
    ResourceOutputs(StepEventMetadata),
    /// A step failed.
    ResourceOperationFailed(StepEventMetadata),
    Diag(Diagnostic),
    Summary(OpSummary),
    Cancel,
}

/// An event stamped with its position in the stream. Events for independent
/// subtrees may interleave; subscribers sort by `sequence` for a
/// deterministic display.
#[derive(Debug, Clone)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub event: EngineEvent,
}

/// Receives the engine's event stream.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: SequencedEvent);
}

/// A sink that drops every event.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: SequencedEvent) {}
}

/// A sink that collects events for later inspection. Clones share state.
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<SequencedEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far, sorted by sequence.
    pub fn events(&self) -> Vec<SequencedEvent> {
        let mut events = self.events.lock().unwrap().clone();
        events.sort_by_key(|e| e.sequence);
        events
    }
}

impl EventSink for CollectingSink {
    fn publish(&self, event: SequencedEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Stamps events with a monotonically increasing sequence number and hands
/// them to the sink. Cheap to clone and share across executor tasks.
#[derive(Clone)]
pub struct EventBus {
    sink: Arc<dyn EventSink>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.sink.publish(SequencedEvent { sequence, event });
    }

    pub fn diag(&self, diag: Diagnostic) {
        self.emit(EngineEvent::Diag(diag));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Severity;

    #[test]
    fn test_bus_assigns_increasing_sequence() {
        let sink = CollectingSink::new();
        let bus = EventBus::new(Arc::new(sink.clone()));
        bus.emit(EngineEvent::Prelude { dry_run: false });
        bus.emit(EngineEvent::Cancel);
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].sequence < events[1].sequence);
        assert!(matches!(events[0].event, EngineEvent::Prelude { .. }));
        assert!(matches!(events[1].event, EngineEvent::Cancel));
    }

    #[test]
    fn test_diag_event_carries_severity() {
        let sink = CollectingSink::new();
        let bus = EventBus::new(Arc::new(sink.clone()));
        bus.diag(Diagnostic::warning(None, "careful"));
        let events = sink.events();
        match &events[0].event {
            EngineEvent::Diag(d) => assert_eq!(d.severity, Severity::Warning),
            other => panic!("expected diag event, got {:?}", other),
        }
    }

    #[test]
    fn test_collecting_sink_clones_share_state() {
        let sink = CollectingSink::new();
        let bus = EventBus::new(Arc::new(sink.clone()));
        let other = sink.clone();
        bus.emit(EngineEvent::Cancel);
        assert_eq!(other.events().len(), 1);
    }
}
