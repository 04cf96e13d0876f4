//! Per-session key/value dictionary sink
//!
//! The kernel-facing dictionary mirrors classification results per
//! conntrack id. The daemon treats it as an opaque sink: entries are
//! added as plugins classify, and a session's whole subspace is
//! dropped when the session leaves the table.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

/// Outbound per-session dictionary operations
///
/// Implementations must be cheap and non-blocking; they are called
/// while per-session locks are held.
pub trait SessionDictionary: Send + Sync {
    /// Set one key in the session subspace for `ctid`
    fn add_session_entry(&self, ctid: u32, key: &str, value: Value);

    /// Drop the whole subspace for `ctid`
    fn delete_session(&self, ctid: u32);
}

/// In-memory dictionary store
///
/// The production deployment points this daemon at the kernel dict
/// interface; this store keeps the same contract in userspace and is
/// what capture/playback and the test suite observe.
#[derive(Default)]
pub struct InMemoryDictionary {
    entries: RwLock<HashMap<u32, HashMap<String, Value>>>,
}

impl InMemoryDictionary {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Read back one value (primarily for tests and status queries)
    pub fn get(&self, ctid: u32, key: &str) -> Option<Value> {
        self.entries.read().get(&ctid).and_then(|m| m.get(key)).cloned()
    }

    /// Number of sessions with at least one entry
    pub fn session_count(&self) -> usize {
        self.entries.read().len()
    }
}

impl SessionDictionary for InMemoryDictionary {
    fn add_session_entry(&self, ctid: u32, key: &str, value: Value) {
        trace!("dict set ctid:{} {}={}", ctid, key, value);
        self.entries
            .write()
            .entry(ctid)
            .or_default()
            .insert(key.to_string(), value);
    }

    fn delete_session(&self, ctid: u32) {
        trace!("dict delete ctid:{}", ctid);
        self.entries.write().remove(&ctid);
    }
}

/// Dictionary sink that drops everything (`--disable-dict`)
#[derive(Default)]
pub struct NullDictionary;

impl SessionDictionary for NullDictionary {
    fn add_session_entry(&self, _ctid: u32, _key: &str, _value: Value) {}

    fn delete_session(&self, _ctid: u32) {}
}
