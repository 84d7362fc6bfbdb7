//! Telemetry sinks.

use lspmux_proxy::TelemetrySink;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// Hands backend telemetry events to the tracing subscriber.
#[derive(Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: Value) {
        debug!(target: "lspmux::telemetry", %event, "backend telemetry event");
    }
}

/// Buffers events in memory; for tests and diagnostics.
#[derive(Default)]
pub struct CollectingTelemetry {
    events: Mutex<Vec<Value>>,
}

impl CollectingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Value> {
        std::mem::take(&mut self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl TelemetrySink for CollectingTelemetry {
    fn record(&self, event: Value) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collecting_sink_buffers_events() {
        let sink = CollectingTelemetry::new();
        sink.record(json!({"span": "a"}));
        sink.record(json!({"span": "b"}));
        assert_eq!(sink.len(), 2);

        let events = sink.take();
        assert_eq!(events[0]["span"], "a");
        assert!(sink.is_empty());
    }
}
