//! Event reporting
//!
//! Append-only stream of classification and lifecycle events. Each
//! event names a kind (`session_new`, `session_nat`, `session_classify`,
//! `session_sni`, ...), a logical table, a schema version, the primary
//! columns identifying the row, and the columns modified by the event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// One report event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id
    pub id: Uuid,
    /// Event kind tag
    pub name: String,
    /// Logical table the event updates
    pub table: String,
    /// Schema version of the column set
    pub schema_version: u32,
    /// Primary key columns
    pub columns: HashMap<String, Value>,
    /// Columns modified by this event
    pub modified_columns: HashMap<String, Value>,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
}

/// Build an event with the standard envelope filled in
pub fn create_event(
    name: &str,
    table: &str,
    schema_version: u32,
    columns: HashMap<String, Value>,
    modified_columns: HashMap<String, Value>,
) -> Event {
    Event {
        id: Uuid::new_v4(),
        name: name.to_string(),
        table: table.to_string(),
        schema_version,
        columns,
        modified_columns,
        timestamp: Utc::now(),
    }
}

/// Append-only event sink
pub trait EventSink: Send + Sync {
    fn log_event(&self, event: Event);

    /// Total events accepted so far
    fn events_logged(&self) -> u64;
}

/// Sink that emits events on the tracing stream
#[derive(Default)]
pub struct TracingSink {
    counter: AtomicU64,
}

impl TracingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl EventSink for TracingSink {
    fn log_event(&self, event: Event) {
        self.counter.fetch_add(1, Ordering::Relaxed);
        info!(
            event = %event.name,
            table = %event.table,
            "report: {}",
            serde_json::to_string(&event.modified_columns).unwrap_or_default()
        );
    }

    fn events_logged(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// Sink that retains events in memory for inspection
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all retained events
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events matching a kind tag
    pub fn events_named(&self, name: &str) -> Vec<Event> {
        self.events.lock().iter().filter(|e| e.name == name).cloned().collect()
    }
}

impl EventSink for MemorySink {
    fn log_event(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn events_logged(&self) -> u64 {
        self.events.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_event_envelope() {
        let mut columns = HashMap::new();
        columns.insert("session_id".to_string(), json!(42));
        let event = create_event("session_new", "sessions", 1, columns, HashMap::new());

        assert_eq!(event.name, "session_new");
        assert_eq!(event.table, "sessions");
        assert_eq!(event.schema_version, 1);
        assert_eq!(event.columns["session_id"], json!(42));
    }

    #[test]
    fn test_memory_sink_counts_and_filters() {
        let sink = MemorySink::new();
        sink.log_event(create_event("session_new", "sessions", 1, HashMap::new(), HashMap::new()));
        sink.log_event(create_event("session_sni", "sessions", 2, HashMap::new(), HashMap::new()));

        assert_eq!(sink.events_logged(), 2);
        assert_eq!(sink.events_named("session_sni").len(), 1);
    }
}
