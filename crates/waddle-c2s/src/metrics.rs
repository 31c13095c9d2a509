//! Offline delivery and module metrics.
//!
//! Uses the global OpenTelemetry meter provider, which must be installed by
//! the host application. Without one every recording is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-c2s"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for messages stored in offline queues.
pub fn offline_archived() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.offline.archived")
        .with_description("Total messages stored for offline recipients")
        .with_unit("message")
        .build()
}

/// Counter for messages refused because the offline queue was full.
pub fn offline_refused() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.offline.refused")
        .with_description("Total messages refused by offline admission control")
        .with_unit("message")
        .build()
}

/// Counter for stored messages handed to a reconnected session.
pub fn offline_delivered() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.offline.delivered")
        .with_description("Total stored messages delivered after reconnect")
        .with_unit("message")
        .build()
}

/// Counter for storage faults surfaced by modules.
pub fn storage_faults() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.storage.faults")
        .with_description("Total storage faults reported as internal-server-error")
        .with_unit("fault")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for bound client streams.
pub fn streams_bound() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.c2s.streams.bound")
        .with_description("Current number of bound client streams")
        .with_unit("stream")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a message stored for an offline recipient.
pub fn record_offline_archived() {
    offline_archived().add(1, &[]);
}

/// Record a message refused by offline admission control.
pub fn record_offline_refused() {
    offline_refused().add(1, &[]);
}

/// Record a completed offline delivery of `count` messages.
pub fn record_offline_delivered(count: u64) {
    offline_delivered().add(count, &[]);
}

/// Record a storage fault in a module.
pub fn record_storage_fault(module: &str) {
    storage_faults().add(1, &[KeyValue::new("module", module.to_string())]);
}

/// Record the bound stream count.
pub fn record_bound_streams(count: i64) {
    streams_bound().record(count, &[]);
}
