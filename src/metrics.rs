use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Per-stream counters, registered in their own registry so several engines
/// can live in one process without name clashes.
pub struct StreamMetrics {
    pub messages_received: IntCounter,
    pub messages_delivered: IntCounter,
    pub messages_halted: IntCounter,
    pub messages_requeued: IntCounter,
    pub messages_unrouted: IntCounter,
    pub stage_errors: IntCounter,
    pub retrieval_errors: IntCounter,
    pub stream_failures: IntCounter,
    pub registry: Registry,
}

impl StreamMetrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let messages_received = register_counter(
            &registry,
            "messages_received_total",
            "Total number of messages pulled from the source",
        );
        let messages_delivered = register_counter(
            &registry,
            "messages_delivered_total",
            "Total number of messages handed to a sink",
        );
        let messages_halted = register_counter(
            &registry,
            "messages_halted_total",
            "Total number of messages halted by a stage",
        );
        let messages_requeued = register_counter(
            &registry,
            "messages_requeued_total",
            "Total number of messages returned to the source retry buffer",
        );
        let messages_unrouted = register_counter(
            &registry,
            "messages_unrouted_total",
            "Total number of messages routed to an unknown pipeline",
        );
        let stage_errors = register_counter(
            &registry,
            "stage_errors_total",
            "Total number of filter, processor and sink errors",
        );
        let retrieval_errors = register_counter(
            &registry,
            "retrieval_errors_total",
            "Total number of failed source polls",
        );
        let stream_failures = register_counter(
            &registry,
            "stream_failures_total",
            "Total number of streams marked as failed",
        );

        Arc::new(Self {
            messages_received,
            messages_delivered,
            messages_halted,
            messages_requeued,
            messages_unrouted,
            stage_errors,
            retrieval_errors,
            stream_failures,
            registry,
        })
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode stream metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

fn register_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help)
        .unwrap_or_else(|e| panic!("Failed to create {} counter: {}", name, e));
    registry
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|e| panic!("Failed to register {} counter: {}", name, e));
    counter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = StreamMetrics::new();
        metrics.messages_received.inc();
        metrics.messages_received.inc();
        metrics.stage_errors.inc();

        let text = metrics.render();
        assert!(text.contains("messages_received_total 2"));
        assert!(text.contains("stage_errors_total 1"));
    }

    #[test]
    fn test_independent_registries() {
        let first = StreamMetrics::new();
        let second = StreamMetrics::new();
        first.messages_delivered.inc();
        assert_eq!(first.messages_delivered.get(), 1);
        assert_eq!(second.messages_delivered.get(), 0);
    }
}
