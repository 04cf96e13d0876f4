//! Event dispatch core
//!
//! Owns the session and conntrack tables, the three subscription
//! registries, and the session-id allocator, and routes the three
//! kernel event streams (nfqueue, conntrack, netlogger) into
//! subscribed handlers.
//!
//! Lifecycle is explicit: `Dispatch::startup` constructs the tables
//! and starts the expiry sweep; `shutdown` stops the sweep. Nothing is
//! initialised on first use.

pub mod conntrack;
pub mod netlogger;
pub mod nfqueue;
pub mod registry;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dict::SessionDictionary;
use crate::reports::EventSink;

pub use conntrack::{ConntrackEntry, ConntrackEvent, ConntrackEventKind, ConntrackTable, TrafficCounters};
pub use netlogger::NetloggerMessage;
pub use registry::{
    ConntrackHandler, NetloggerHandler, NfqueueHandler, NfqueueMessage, NfqueueResult,
    SubscriptionHolder, SubscriptionRegistry,
};
pub use session::{AttachValue, SessionEntry, SessionIdGenerator, SessionTable};

/// How long a shutdown waits for the sweep task to acknowledge
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Table housekeeping settings
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Idle time after which table entries are swept
    pub session_timeout: Duration,
    /// Cadence of the expiry sweep
    pub sweep_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// The dispatch core
pub struct Dispatch {
    pub(crate) sessions: SessionTable,
    pub(crate) conntrack: ConntrackTable,
    pub(crate) nfqueue_subscriptions: SubscriptionRegistry<dyn NfqueueHandler>,
    pub(crate) conntrack_subscriptions: SubscriptionRegistry<dyn ConntrackHandler>,
    pub(crate) netlogger_subscriptions: SubscriptionRegistry<dyn NetloggerHandler>,
    pub(crate) session_ids: SessionIdGenerator,
    pub(crate) dict: Arc<dyn SessionDictionary>,
    pub(crate) reports: Arc<dyn EventSink>,
    settings: DispatchSettings,
    sweep: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl Dispatch {
    /// Construct the dispatch core and start the expiry sweep
    pub fn startup(
        settings: DispatchSettings,
        dict: Arc<dyn SessionDictionary>,
        reports: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let dispatch = Arc::new(Self {
            sessions: SessionTable::new(Arc::clone(&dict)),
            conntrack: ConntrackTable::new(),
            nfqueue_subscriptions: SubscriptionRegistry::new("nfqueue"),
            conntrack_subscriptions: SubscriptionRegistry::new("conntrack"),
            netlogger_subscriptions: SubscriptionRegistry::new("netlogger"),
            session_ids: SessionIdGenerator::new(),
            dict,
            reports,
            settings,
            sweep: Mutex::new(None),
        });

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let sweeper = Arc::clone(&dispatch);
        let interval = sweeper.settings.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            let mut counter: u64 = 0;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = ticker.tick() => {
                        counter += 1;
                        debug!("running table cleaner {}", counter);
                        sweeper.clean_tables();
                    }
                }
            }
        });
        *dispatch.sweep.lock() = Some((stop_tx, handle));

        info!("dispatch started");
        dispatch
    }

    /// Stop the expiry sweep
    ///
    /// Waits up to ten seconds for the task to acknowledge, then
    /// proceeds with a warning.
    pub async fn shutdown(&self) {
        let Some((stop_tx, handle)) = self.sweep.lock().take() else {
            return;
        };
        let _ = stop_tx.send(());
        if tokio::time::timeout(SHUTDOWN_WAIT, handle).await.is_err() {
            warn!("failed to properly shutdown table cleaner");
        }
        info!("dispatch stopped");
    }

    /// One sweep pass over both tables
    pub fn clean_tables(&self) {
        let timeout = self.settings.session_timeout;
        self.sessions.clean(timeout);
        self.conntrack.clean(timeout);
    }

    // ------------------------------------------------------------------
    // Subscription registration
    // ------------------------------------------------------------------

    /// Subscribe to nfqueue packet events
    ///
    /// Applies to sessions created after this call; existing sessions
    /// keep the snapshot taken at their creation.
    pub fn register_nfqueue_subscription(
        &self,
        owner: &str,
        priority: i32,
        handler: Arc<dyn NfqueueHandler>,
    ) {
        self.nfqueue_subscriptions.register(owner, priority, handler);
    }

    /// Subscribe to conntrack events
    pub fn register_conntrack_subscription(
        &self,
        owner: &str,
        priority: i32,
        handler: Arc<dyn ConntrackHandler>,
    ) {
        self.conntrack_subscriptions.register(owner, priority, handler);
    }

    /// Subscribe to netlogger events
    pub fn register_netlogger_subscription(
        &self,
        owner: &str,
        priority: i32,
        handler: Arc<dyn NetloggerHandler>,
    ) {
        self.netlogger_subscriptions.register(owner, priority, handler);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn find_session(&self, ctid: u32) -> Option<Arc<SessionEntry>> {
        self.sessions.find(ctid)
    }

    pub fn find_conntrack(&self, ctid: u32) -> Option<Arc<ConntrackEntry>> {
        self.conntrack.find(ctid)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn conntrack_count(&self) -> usize {
        self.conntrack.len()
    }

    pub fn reports(&self) -> &Arc<dyn EventSink> {
        &self.reports
    }

    pub fn dict(&self) -> &Arc<dyn SessionDictionary> {
        &self.dict
    }
}
