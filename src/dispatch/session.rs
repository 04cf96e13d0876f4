//! Session state and the session table
//!
//! A session is the userspace representation of one flow, keyed by
//! conntrack id. It carries identity (tuples), counters, the snapshot
//! of nfqueue subscriptions taken at creation, and a free-form
//! attachment map plugins use to publish per-flow results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde_json::{json, Value};
use tracing::{debug, trace};

use super::registry::NfqueueSubscription;
use crate::core::Tuple;
use crate::dict::SessionDictionary;

/// Typed attachment value
///
/// Plugins attach auxiliary per-flow data without a shared schema;
/// these variants cover the value kinds that actually occur.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachValue {
    Str(String),
    UInt(u64),
    Timestamp(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl AttachValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttachValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            AttachValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to the dictionary/report representation
    pub fn to_json(&self) -> Value {
        match self {
            AttachValue::Str(s) => json!(s),
            AttachValue::UInt(v) => json!(v),
            AttachValue::Timestamp(t) => json!(t.to_rfc3339()),
            AttachValue::Blob(b) => json!(b),
        }
    }
}

/// Per-connection state
pub struct SessionEntry {
    session_id: u64,
    conntrack_id: u32,
    creation_time: Instant,
    last_activity: Mutex<Instant>,
    event_count: AtomicU64,
    packet_count: AtomicU64,
    byte_count: AtomicU64,
    client_side_tuple: Tuple,
    server_side_tuple: Mutex<Tuple>,
    conntrack_confirmed: AtomicBool,
    subscriptions: Mutex<HashMap<String, NfqueueSubscription>>,
    attachments: Mutex<HashMap<String, AttachValue>>,
}

impl SessionEntry {
    /// Create a session with the given subscription snapshot
    pub fn new(
        session_id: u64,
        conntrack_id: u32,
        client_side_tuple: Tuple,
        subscriptions: HashMap<String, NfqueueSubscription>,
    ) -> Self {
        Self {
            session_id,
            conntrack_id,
            creation_time: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            event_count: AtomicU64::new(1),
            packet_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
            client_side_tuple,
            server_side_tuple: Mutex::new(Tuple::default()),
            conntrack_confirmed: AtomicBool::new(false),
            subscriptions: Mutex::new(subscriptions),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn conntrack_id(&self) -> u32 {
        self.conntrack_id
    }

    pub fn creation_time(&self) -> Instant {
        self.creation_time
    }

    pub fn client_side_tuple(&self) -> &Tuple {
        &self.client_side_tuple
    }

    pub fn server_side_tuple(&self) -> Tuple {
        self.server_side_tuple.lock().clone()
    }

    pub fn conntrack_confirmed(&self) -> bool {
        self.conntrack_confirmed.load(Ordering::Acquire)
    }

    /// Record the post-NAT tuple learned from conntrack and mark the
    /// session confirmed. Returns false when it was already confirmed.
    pub fn confirm(&self, server_side_tuple: Tuple) -> bool {
        *self.server_side_tuple.lock() = server_side_tuple;
        !self.conntrack_confirmed.swap(true, Ordering::AcqRel)
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Stamp activity for an event on an existing session
    pub fn note_event(&self) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Account one packet against the session counters
    pub fn note_packet(&self, bytes: usize) {
        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn last_activity_elapsed(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Backdate the activity stamp (sweep tests and playback)
    pub fn set_idle_for(&self, idle: Duration) {
        if let Some(then) = Instant::now().checked_sub(idle) {
            *self.last_activity.lock() = then;
        }
    }

    // ------------------------------------------------------------------
    // Subscription set (snapshot taken at creation; only release shrinks it)
    // ------------------------------------------------------------------

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Subscriptions at exactly the given priority
    pub fn subscriptions_at(&self, priority: i32) -> Vec<NfqueueSubscription> {
        self.subscriptions
            .lock()
            .values()
            .filter(|s| s.priority == priority)
            .cloned()
            .collect()
    }

    /// Highest priority still present, or None when the set is empty
    pub fn max_subscription_priority(&self) -> Option<i32> {
        self.subscriptions.lock().values().map(|s| s.priority).max()
    }

    pub fn has_subscription(&self, owner: &str) -> bool {
        self.subscriptions.lock().contains_key(owner)
    }

    /// Remove a released handler from this session
    pub fn remove_subscription(&self, owner: &str) {
        self.subscriptions.lock().remove(owner);
    }

    // ------------------------------------------------------------------
    // Attachments
    //
    // Two access styles: accessor methods that lock per call, and
    // `lock_attachments` which hands the whole map to the caller for a
    // batch of reads and writes. Never call the accessors while holding
    // the guard; the lock is not re-entrant.
    // ------------------------------------------------------------------

    pub fn put_attachment(&self, name: &str, value: AttachValue) {
        self.attachments.lock().insert(name.to_string(), value);
    }

    pub fn get_attachment(&self, name: &str) -> Option<AttachValue> {
        self.attachments.lock().get(name).cloned()
    }

    pub fn delete_attachment(&self, name: &str) -> bool {
        self.attachments.lock().remove(name).is_some()
    }

    /// Lock the attachment map for batched access
    pub fn lock_attachments(&self) -> MutexGuard<'_, HashMap<String, AttachValue>> {
        self.attachments.lock()
    }
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("session_id", &self.session_id)
            .field("conntrack_id", &self.conntrack_id)
            .field("client_side_tuple", &self.client_side_tuple)
            .field("conntrack_confirmed", &self.conntrack_confirmed())
            .finish()
    }
}

/// Monotonic session-id allocator
///
/// Seeded so the high 16 bits are zero, the middle 32 bits are the
/// startup time in seconds since the epoch, and the low 16 bits are
/// zero. Ids therefore keep increasing across restarts unless the
/// daemon sustains more than ~65k sessions per second. Zero is
/// reserved as "unset" and skipped on wraparound.
pub struct SessionIdGenerator {
    next: Mutex<u64>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            next: Mutex::new((epoch & 0xFFFF_FFFF) << 16),
        }
    }

    #[cfg(test)]
    fn with_seed(seed: u64) -> Self {
        Self {
            next: Mutex::new(seed),
        }
    }

    /// Return the next sequential session id
    pub fn next_id(&self) -> u64 {
        let mut guard = self.next.lock();
        let value = *guard;
        *guard = guard.wrapping_add(1);
        if *guard == 0 {
            *guard = 1;
        }
        value
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Session table keyed by conntrack id
pub struct SessionTable {
    sessions: Mutex<HashMap<u32, Arc<SessionEntry>>>,
    dict: Arc<dyn SessionDictionary>,
}

impl SessionTable {
    pub fn new(dict: Arc<dyn SessionDictionary>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            dict,
        }
    }

    pub fn find(&self, ctid: u32) -> Option<Arc<SessionEntry>> {
        let found = self.sessions.lock().get(&ctid).cloned();
        trace!("lookup session ctid {} -> {}", ctid, found.is_some());
        found
    }

    /// Insert a session, replacing any prior entry for the ctid
    ///
    /// The session id is published into the dictionary subspace.
    pub fn insert(&self, ctid: u32, entry: Arc<SessionEntry>) {
        trace!("insert session ctid {} -> {}", ctid, entry.client_side_tuple());
        let session_id = entry.session_id();
        self.sessions.lock().insert(ctid, entry);
        self.dict.add_session_entry(ctid, "session_id", json!(session_id));
    }

    /// Remove a session and clear its dictionary subspace
    pub fn remove(&self, ctid: u32) -> Option<Arc<SessionEntry>> {
        trace!("remove session ctid {}", ctid);
        let removed = self.sessions.lock().remove(&ctid);
        if removed.is_some() {
            self.dict.delete_session(ctid);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Remove sessions idle longer than `timeout`
    ///
    /// Stale entries are expected here: a blocked flow never reaches
    /// the conntrack-confirmed state, so it sees no DESTROY and sits in
    /// the table until this sweep or until its ctid is re-used.
    pub fn clean(&self, timeout: Duration) -> usize {
        let stale: Vec<(u32, Arc<SessionEntry>)> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, v)| v.last_activity_elapsed() > timeout)
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        for (ctid, entry) in &stale {
            self.remove(*ctid);
            debug!(
                "removing stale session entry {} {}",
                ctid,
                entry.client_side_tuple()
            );
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::InMemoryDictionary;

    fn sample_tuple() -> Tuple {
        Tuple::new(6, "10.0.0.1".parse().unwrap(), 5000, "1.2.3.4".parse().unwrap(), 443)
    }

    #[test]
    fn test_session_ids_strictly_increase() {
        let gen = SessionIdGenerator::new();
        let mut prev = gen.next_id();
        for _ in 0..1000 {
            let next = gen.next_id();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_session_id_skips_zero_on_wrap() {
        let gen = SessionIdGenerator::with_seed(u64::MAX);
        assert_eq!(gen.next_id(), u64::MAX);
        // wrapped past zero, which stays reserved
        assert_eq!(gen.next_id(), 1);
    }

    #[test]
    fn test_attachment_accessors() {
        let session = SessionEntry::new(1, 100, sample_tuple(), HashMap::new());

        session.put_attachment("ssl_sni", AttachValue::Str("example.com".into()));
        assert_eq!(
            session.get_attachment("ssl_sni").and_then(|v| v.as_str().map(String::from)),
            Some("example.com".to_string())
        );

        assert!(session.delete_attachment("ssl_sni"));
        assert!(!session.delete_attachment("ssl_sni"));
    }

    #[test]
    fn test_locked_attachment_batch() {
        let session = SessionEntry::new(1, 100, sample_tuple(), HashMap::new());
        {
            let mut attachments = session.lock_attachments();
            attachments.insert("application_confidence".into(), AttachValue::UInt(80));
            attachments.insert("application_name".into(), AttachValue::Str("FOO".into()));
        }
        assert_eq!(
            session.get_attachment("application_confidence").and_then(|v| v.as_uint()),
            Some(80)
        );
    }

    #[test]
    fn test_confirm_reports_first_transition() {
        let session = SessionEntry::new(1, 100, sample_tuple(), HashMap::new());
        assert!(!session.conntrack_confirmed());
        assert!(session.confirm(sample_tuple()));
        assert!(session.conntrack_confirmed());
        assert!(!session.confirm(sample_tuple()));
    }

    #[test]
    fn test_table_insert_remove_round_trip() {
        let dict = InMemoryDictionary::new();
        let table = SessionTable::new(dict.clone());
        let entry = Arc::new(SessionEntry::new(42, 100, sample_tuple(), HashMap::new()));

        table.insert(100, entry);
        assert_eq!(table.len(), 1);
        assert_eq!(dict.get(100, "session_id"), Some(json!(42)));

        table.remove(100);
        assert!(table.is_empty());
        assert_eq!(dict.get(100, "session_id"), None);
        assert_eq!(dict.session_count(), 0);
    }

    #[test]
    fn test_clean_removes_idle_sessions() {
        let dict = InMemoryDictionary::new();
        let table = SessionTable::new(dict.clone());
        let entry = Arc::new(SessionEntry::new(1, 100, sample_tuple(), HashMap::new()));
        entry.set_idle_for(Duration::from_secs(601));
        table.insert(100, entry);

        let removed = table.clean(Duration::from_secs(600));
        assert_eq!(removed, 1);
        assert!(table.is_empty());
        assert_eq!(dict.get(100, "session_id"), None);
    }

    #[test]
    fn test_clean_keeps_active_sessions() {
        let dict = InMemoryDictionary::new();
        let table = SessionTable::new(dict);
        table.insert(
            100,
            Arc::new(SessionEntry::new(1, 100, sample_tuple(), HashMap::new())),
        );

        assert_eq!(table.clean(Duration::from_secs(600)), 0);
        assert_eq!(table.len(), 1);
    }
}
