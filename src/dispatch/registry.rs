//! Subscription registries
//!
//! Three independent registries, one per event kind. Each maps an
//! owner name to a handler registered at an integer priority; lower
//! priorities run earlier, equal priorities run concurrently within a
//! wave. Registration after a session is created does not affect that
//! session: the nfqueue dispatcher snapshots the registry at session
//! creation time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::conntrack::{ConntrackEntry, ConntrackEventKind};
use super::netlogger::NetloggerMessage;
use super::session::SessionEntry;
use crate::core::{Packet, Tuple};

/// Verdict returned by one nfqueue handler
#[derive(Debug, Clone, Default)]
pub struct NfqueueResult {
    /// Name of the subscription that produced this result
    pub owner: String,
    /// Bits to OR into the packet mark
    pub packet_mark: u32,
    /// True when the handler no longer wants packets for this session
    pub session_release: bool,
}

/// Message delivered to nfqueue handlers
#[derive(Clone)]
pub struct NfqueueMessage {
    /// The session this packet belongs to
    pub session: Arc<SessionEntry>,
    /// Client-side tuple as observed on this packet
    pub tuple: Tuple,
    /// Decoded packet with layers and payload
    pub packet: Arc<Packet>,
    /// Raw packet length
    pub length: usize,
}

/// Handler for nfqueue packet events
#[async_trait]
pub trait NfqueueHandler: Send + Sync {
    async fn handle(&self, message: NfqueueMessage, ctid: u32, new_session: bool) -> NfqueueResult;
}

/// Handler for conntrack events
#[async_trait]
pub trait ConntrackHandler: Send + Sync {
    async fn handle(&self, kind: ConntrackEventKind, entry: Arc<ConntrackEntry>);
}

/// Handler for log-target events
#[async_trait]
pub trait NetloggerHandler: Send + Sync {
    async fn handle(&self, message: Arc<NetloggerMessage>);
}

/// A named handler registered at a priority
pub struct SubscriptionHolder<H: ?Sized> {
    pub owner: String,
    pub priority: i32,
    pub handler: Arc<H>,
}

impl<H: ?Sized> Clone for SubscriptionHolder<H> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            priority: self.priority,
            handler: Arc::clone(&self.handler),
        }
    }
}

pub type NfqueueSubscription = SubscriptionHolder<dyn NfqueueHandler>;
pub type ConntrackSubscription = SubscriptionHolder<dyn ConntrackHandler>;
pub type NetloggerSubscription = SubscriptionHolder<dyn NetloggerHandler>;

/// Name-keyed registry for one event kind
pub struct SubscriptionRegistry<H: ?Sized> {
    kind: &'static str,
    subscriptions: Mutex<HashMap<String, SubscriptionHolder<H>>>,
}

impl<H: ?Sized> SubscriptionRegistry<H> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace the subscription for `owner`
    ///
    /// Priority values are taken as-is; ordering happens at dispatch
    /// time.
    pub fn register(&self, owner: &str, priority: i32, handler: Arc<H>) {
        info!("adding {} subscription ({}, {})", self.kind, owner, priority);
        self.subscriptions.lock().insert(
            owner.to_string(),
            SubscriptionHolder {
                owner: owner.to_string(),
                priority,
                handler,
            },
        );
    }

    /// Remove the subscription for `owner`
    pub fn unregister(&self, owner: &str) {
        self.subscriptions.lock().remove(owner);
    }

    /// Shallow copy of the current subscription set
    pub fn snapshot(&self) -> HashMap<String, SubscriptionHolder<H>> {
        self.subscriptions.lock().clone()
    }

    /// Current subscriptions as a list
    pub fn snapshot_list(&self) -> Vec<SubscriptionHolder<H>> {
        self.subscriptions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }
}
