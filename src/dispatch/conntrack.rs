//! Conntrack event handling
//!
//! Mirrors kernel connection-tracking state into the conntrack table,
//! reconciles it with the session table, maintains byte/rate counters,
//! and fans events out to conntrack subscribers in priority waves.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use super::Dispatch;
use crate::core::Tuple;

/// Rates assume the kernel's 60-second accounting dump period; the
/// caller does not carry the actual inter-update interval.
const RATE_INTERVAL_SECS: u64 = 60;

/// Kind of conntrack event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConntrackEventKind {
    New,
    Update,
    Destroy,
}

impl ConntrackEventKind {
    /// Decode the single-character kind used on the kernel boundary
    pub fn from_flag(flag: char) -> Option<Self> {
        match flag {
            'N' => Some(ConntrackEventKind::New),
            'U' => Some(ConntrackEventKind::Update),
            'D' => Some(ConntrackEventKind::Destroy),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConntrackEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConntrackEventKind::New => write!(f, "N"),
            ConntrackEventKind::Update => write!(f, "U"),
            ConntrackEventKind::Destroy => write!(f, "D"),
        }
    }
}

/// One event as delivered by the kernel binding
#[derive(Debug, Clone)]
pub struct ConntrackEvent {
    pub ctid: u32,
    pub kind: ConntrackEventKind,
    pub protocol: u8,
    pub client_addr: IpAddr,
    pub server_addr: IpAddr,
    pub client_port: u16,
    pub server_port: u16,
    pub nat_client_addr: IpAddr,
    pub nat_server_addr: IpAddr,
    pub nat_client_port: u16,
    pub nat_server_port: u16,
    pub c2s_bytes: u64,
    pub s2c_bytes: u64,
}

impl ConntrackEvent {
    /// Pre-NAT tuple as seen on ingress
    pub fn client_side_tuple(&self) -> Tuple {
        Tuple::new(
            self.protocol,
            self.client_addr,
            self.client_port,
            self.server_addr,
            self.server_port,
        )
    }

    /// Post-NAT tuple from the reply direction
    pub fn server_side_tuple(&self) -> Tuple {
        Tuple::new(
            self.protocol,
            self.nat_client_addr,
            self.nat_client_port,
            self.nat_server_addr,
            self.nat_server_port,
        )
    }
}

/// Bidirectional byte counters and derived per-second rates
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficCounters {
    pub c2s_bytes: u64,
    pub s2c_bytes: u64,
    pub total_bytes: u64,
    pub c2s_rate: f32,
    pub s2c_rate: f32,
    pub total_rate: f32,
}

/// Per-connection conntrack state
///
/// The session link is held as a session id plus a table lookup, never
/// as an owning reference; the session table exclusively owns its
/// entries.
pub struct ConntrackEntry {
    conntrack_id: u32,
    session_id: u64,
    linked_session_id: AtomicU64,
    creation_time: Instant,
    last_activity: Mutex<Instant>,
    client_side_tuple: Tuple,
    server_side_tuple: Tuple,
    event_count: AtomicU64,
    counters: Mutex<TrafficCounters>,
    purge_flag: AtomicBool,
}

impl ConntrackEntry {
    pub fn new(
        conntrack_id: u32,
        session_id: u64,
        client_side_tuple: Tuple,
        server_side_tuple: Tuple,
    ) -> Self {
        Self {
            conntrack_id,
            session_id,
            linked_session_id: AtomicU64::new(0),
            creation_time: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            client_side_tuple,
            server_side_tuple,
            event_count: AtomicU64::new(1),
            counters: Mutex::new(TrafficCounters::default()),
            purge_flag: AtomicBool::new(false),
        }
    }

    pub fn conntrack_id(&self) -> u32 {
        self.conntrack_id
    }

    /// Placeholder id allocated when the entry was created
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Session linked after tuple confirmation, 0 when unlinked
    pub fn linked_session_id(&self) -> u64 {
        self.linked_session_id.load(Ordering::Acquire)
    }

    pub fn link_session(&self, session_id: u64) {
        self.linked_session_id.store(session_id, Ordering::Release);
    }

    pub fn creation_time(&self) -> Instant {
        self.creation_time
    }

    pub fn client_side_tuple(&self) -> &Tuple {
        &self.client_side_tuple
    }

    pub fn server_side_tuple(&self) -> &Tuple {
        &self.server_side_tuple
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    pub fn note_event(&self) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity_elapsed(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Backdate the activity stamp (sweep tests)
    pub fn set_idle_for(&self, idle: Duration) {
        if let Some(then) = Instant::now().checked_sub(idle) {
            *self.last_activity.lock() = then;
        }
    }

    pub fn counters(&self) -> TrafficCounters {
        *self.counters.lock()
    }

    pub fn purge_flag(&self) -> bool {
        self.purge_flag.load(Ordering::Acquire)
    }

    pub fn set_purge_flag(&self, value: bool) {
        self.purge_flag.store(value, Ordering::Release);
    }

    /// Fold a kernel byte-count update into the counters
    ///
    /// Returns false for a counter regression: the tuple was taken over
    /// by a new connection (common for UDP), so counters reset to the
    /// reported values and no rate is derived. The caller suppresses
    /// subscriber fan-out for that event.
    pub fn apply_update(&self, c2s_bytes: u64, s2c_bytes: u64) -> bool {
        let mut counters = self.counters.lock();

        let new_total = c2s_bytes + s2c_bytes;
        if c2s_bytes < counters.c2s_bytes || s2c_bytes < counters.s2c_bytes {
            counters.c2s_bytes = c2s_bytes;
            counters.s2c_bytes = s2c_bytes;
            counters.total_bytes = new_total;
            return false;
        }

        let diff_c2s = c2s_bytes - counters.c2s_bytes;
        let diff_s2c = s2c_bytes - counters.s2c_bytes;
        let diff_total = new_total - counters.total_bytes;

        counters.c2s_rate = (diff_c2s / RATE_INTERVAL_SECS) as f32;
        counters.s2c_rate = (diff_s2c / RATE_INTERVAL_SECS) as f32;
        counters.total_rate = (diff_total / RATE_INTERVAL_SECS) as f32;
        counters.c2s_bytes = c2s_bytes;
        counters.s2c_bytes = s2c_bytes;
        counters.total_bytes = new_total;
        true
    }
}

impl std::fmt::Debug for ConntrackEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConntrackEntry")
            .field("conntrack_id", &self.conntrack_id)
            .field("client_side_tuple", &self.client_side_tuple)
            .field("purge_flag", &self.purge_flag())
            .finish()
    }
}

/// Conntrack table keyed by conntrack id
pub struct ConntrackTable {
    entries: Mutex<HashMap<u32, Arc<ConntrackEntry>>>,
}

impl ConntrackTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn find(&self, ctid: u32) -> Option<Arc<ConntrackEntry>> {
        self.entries.lock().get(&ctid).cloned()
    }

    pub fn insert(&self, ctid: u32, entry: Arc<ConntrackEntry>) {
        self.entries.lock().insert(ctid, entry);
    }

    pub fn remove(&self, ctid: u32) -> Option<Arc<ConntrackEntry>> {
        trace!("remove conntrack ctid {}", ctid);
        self.entries.lock().remove(&ctid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove purge-flagged entries idle longer than `timeout`
    ///
    /// DESTROY removes entries inline, so anything reaped here leaked.
    pub fn clean(&self, timeout: Duration) -> usize {
        let stale: Vec<(u32, Arc<ConntrackEntry>)> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, v)| v.purge_flag() && v.last_activity_elapsed() > timeout)
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        for (ctid, entry) in &stale {
            self.remove(*ctid);
            warn!(
                "removing stale conntrack entry {} {}",
                ctid,
                entry.client_side_tuple()
            );
        }
        stale.len()
    }
}

impl Default for ConntrackTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch {
    /// Kernel conntrack callback
    ///
    /// Correlates the event with the session table, updates counters,
    /// and notifies conntrack subscribers in ascending priority waves.
    pub async fn conntrack_event(&self, event: ConntrackEvent) {
        let ctid = event.ctid;

        let entry = match self.conntrack.find(ctid) {
            Some(entry) => {
                entry.note_event();
                trace!(
                    "conntrack event[{},{}]: {}",
                    ctid,
                    event.kind,
                    entry.client_side_tuple()
                );
                entry
            }
            None => {
                let entry = Arc::new(ConntrackEntry::new(
                    ctid,
                    self.session_ids.next_id(),
                    event.client_side_tuple(),
                    event.server_side_tuple(),
                ));
                trace!(
                    "conntrack event[{},{}]: {}",
                    ctid,
                    event.kind,
                    entry.client_side_tuple()
                );
                self.reconcile_session(&event, &entry);
                self.conntrack.insert(ctid, entry.clone());
                entry
            }
        };

        entry.touch();

        match event.kind {
            ConntrackEventKind::Destroy => {
                entry.set_purge_flag(true);
                if entry.linked_session_id() != 0 {
                    self.sessions.remove(ctid);
                }
                self.conntrack.remove(ctid);
            }
            ConntrackEventKind::Update => {
                entry.set_purge_flag(false);
                if !entry.apply_update(event.c2s_bytes, event.s2c_bytes) {
                    // Counter regression: the tuple was re-used by a new
                    // connection. Counters were reset; subscribers are not
                    // notified for this event.
                    debug!("conntrack counter reset for ctid {}", ctid);
                    return;
                }
            }
            ConntrackEventKind::New => {
                entry.set_purge_flag(false);
            }
        }

        self.fan_out_conntrack(event.kind, entry).await;
    }

    /// Cross-reference a fresh conntrack entry against the session table
    fn reconcile_session(&self, event: &ConntrackEvent, entry: &Arc<ConntrackEntry>) {
        let Some(session) = self.sessions.find(event.ctid) else {
            return;
        };

        if session.client_side_tuple() == entry.client_side_tuple() {
            let first = session.confirm(event.server_side_tuple());
            entry.link_session(session.session_id());
            if first && event.kind == ConntrackEventKind::New {
                self.log_nat_event(session.session_id(), &event.server_side_tuple());
            }
            return;
        }

        // A session that never reached conntrack confirmation can have
        // its ctid re-used instantly; a confirmed one cannot.
        info!(
            "conntrack id mismatch! {} conntrack:{} session:{}",
            event.ctid,
            entry.client_side_tuple(),
            session.client_side_tuple()
        );
        if session.conntrack_confirmed() {
            error!("conntrack id re-use detected on confirmed session {}", event.ctid);
            panic!("conntrack id re-use detected");
        }
        info!(
            "removing stale session {} {}",
            event.ctid,
            session.client_side_tuple()
        );
        self.sessions.remove(event.ctid);
    }

    /// Report the post-NAT tuple for a newly confirmed session
    pub(crate) fn log_nat_event(&self, session_id: u64, server_side_tuple: &Tuple) {
        let mut columns = HashMap::new();
        columns.insert("session_id".to_string(), json!(session_id));

        let mut modified = HashMap::new();
        modified.insert(
            "client_addr_new".to_string(),
            json!(server_side_tuple.client_addr.to_string()),
        );
        modified.insert(
            "server_addr_new".to_string(),
            json!(server_side_tuple.server_addr.to_string()),
        );
        modified.insert("client_port_new".to_string(), json!(server_side_tuple.client_port));
        modified.insert("server_port_new".to_string(), json!(server_side_tuple.server_port));

        self.reports.log_event(crate::reports::create_event(
            "session_nat",
            "sessions",
            2,
            columns,
            modified,
        ));
    }

    /// Notify conntrack subscribers in ascending priority waves
    ///
    /// Wave N completes before wave N+1 starts; no verdicts are
    /// collected.
    async fn fan_out_conntrack(&self, kind: ConntrackEventKind, entry: Arc<ConntrackEntry>) {
        let sublist = self.conntrack_subscriptions.snapshot_list();
        let subtotal = sublist.len();
        let Some(max_priority) = sublist.iter().map(|s| s.priority).max() else {
            return;
        };

        let mut subcount = 0;
        let mut priority = 0;

        while subcount < subtotal && priority <= max_priority {
            let mut wave = JoinSet::new();
            for sub in sublist.iter().filter(|s| s.priority == priority) {
                debug!("calling conntrack APP:{} PRIORITY:{}", sub.owner, priority);
                let handler = Arc::clone(&sub.handler);
                let entry = Arc::clone(&entry);
                wave.spawn(async move {
                    handler.handle(kind, entry).await;
                });
                subcount += 1;
            }
            while wave.join_next().await.is_some() {}
            priority += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tuple() -> Tuple {
        Tuple::new(17, "10.0.0.1".parse().unwrap(), 5000, "1.2.3.4".parse().unwrap(), 53)
    }

    #[test]
    fn test_event_kind_from_flag() {
        assert_eq!(ConntrackEventKind::from_flag('N'), Some(ConntrackEventKind::New));
        assert_eq!(ConntrackEventKind::from_flag('U'), Some(ConntrackEventKind::Update));
        assert_eq!(ConntrackEventKind::from_flag('D'), Some(ConntrackEventKind::Destroy));
        assert_eq!(ConntrackEventKind::from_flag('X'), None);
    }

    #[test]
    fn test_apply_update_rates() {
        let entry = ConntrackEntry::new(1, 10, sample_tuple(), sample_tuple());

        assert!(entry.apply_update(6000, 1200));
        let counters = entry.counters();
        assert_eq!(counters.c2s_bytes, 6000);
        assert_eq!(counters.s2c_bytes, 1200);
        assert_eq!(counters.total_bytes, 7200);
        assert_eq!(counters.c2s_rate, 100.0);
        assert_eq!(counters.s2c_rate, 20.0);
        assert_eq!(counters.total_rate, 120.0);
    }

    #[test]
    fn test_apply_update_regression_resets() {
        let entry = ConntrackEntry::new(1, 10, sample_tuple(), sample_tuple());
        assert!(entry.apply_update(2000, 100));

        // lower counters mean the tuple was taken over by a new connection
        assert!(!entry.apply_update(1000, 500));
        let counters = entry.counters();
        assert_eq!(counters.c2s_bytes, 1000);
        assert_eq!(counters.s2c_bytes, 500);
        assert_eq!(counters.total_bytes, 1500);
        // rates from the earlier update are left alone (2000 / 60 integer division)
        assert_eq!(counters.c2s_rate, 33.0);
    }

    #[test]
    fn test_table_clean_requires_purge_flag() {
        let table = ConntrackTable::new();
        let entry = Arc::new(ConntrackEntry::new(1, 10, sample_tuple(), sample_tuple()));
        entry.set_idle_for(Duration::from_secs(601));
        table.insert(1, entry.clone());

        assert_eq!(table.clean(Duration::from_secs(600)), 0);
        assert_eq!(table.len(), 1);

        entry.set_purge_flag(true);
        assert_eq!(table.clean(Duration::from_secs(600)), 1);
        assert!(table.is_empty());
    }
}
