//! Nfqueue event handling
//!
//! Decodes a raw packet, resolves or creates its session, runs the
//! session's subscribed handlers in ascending priority waves, and
//! returns the aggregated packet mark to the kernel binding.
//!
//! Ordering: wave N fully completes before wave N+1 starts; within a
//! wave no order is guaranteed. Concurrent events for one session are
//! accepted; locks are held only around table access and subscription
//! mutation, never across a handler call.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use super::registry::{NfqueueMessage, NfqueueResult};
use super::session::SessionEntry;
use super::Dispatch;
use crate::core::parse_ip_packet;

impl Dispatch {
    /// Kernel nfqueue callback
    ///
    /// `pmark` is the packet's current netfilter mark; the return value
    /// is the updated mark with every handler's contribution OR-ed in.
    /// Undecodable packets come back with the mark unchanged and create
    /// no session state.
    pub async fn nfqueue_event(&self, ctid: u32, data: &[u8], pmark: u32) -> u32 {
        let packet = match parse_ip_packet(data) {
            Ok(packet) => packet,
            Err(err) => {
                trace!("skipping undecodable packet for ctid {}: {}", ctid, err);
                return pmark;
            }
        };

        // only TCP and UDP carry sessions worth inspecting
        if !packet.layer4.has_ports() {
            return pmark;
        }

        let tuple = packet.tuple();
        trace!("nfqueue event[{}]: {}", ctid, tuple);

        let mut new_session = false;
        let mut existing = self.sessions.find(ctid);

        if let Some(session) = &existing {
            trace!("session found {} in table", ctid);
            session.note_event();
            if *session.client_side_tuple() != tuple {
                info!(
                    "conntrack id mismatch! {} nfqueue:{} session:{}",
                    ctid,
                    tuple,
                    session.client_side_tuple()
                );
                if session.conntrack_confirmed() {
                    error!("conntrack id re-use detected on confirmed session {}", ctid);
                    panic!("conntrack id re-use detected");
                }
                info!("removing stale session {} {}", ctid, session.client_side_tuple());
                self.sessions.remove(ctid);
                existing = None;
            }
        }

        let session = match existing {
            Some(session) => session,
            None => {
                trace!("session adding {} to table", ctid);
                new_session = true;
                self.create_session(ctid, tuple.clone())
            }
        };

        session.note_packet(data.len());

        let message = NfqueueMessage {
            session: Arc::clone(&session),
            tuple,
            packet: Arc::new(packet),
            length: data.len(),
        };

        self.run_nfqueue_waves(&session, message, ctid, new_session, pmark)
            .await
    }

    /// Allocate a session, snapshot the live subscriptions onto it, and
    /// publish it to the table and report stream
    fn create_session(&self, ctid: u32, tuple: crate::core::Tuple) -> Arc<SessionEntry> {
        let session = Arc::new(SessionEntry::new(
            self.session_ids.next_id(),
            ctid,
            tuple.clone(),
            self.nfqueue_subscriptions.snapshot(),
        ));

        // The conntrack NEW event can precede the first queued packet;
        // adopt the waiting entry's post-NAT tuple when it does.
        if let Some(entry) = self.conntrack.find(ctid) {
            if entry.client_side_tuple() == &tuple {
                let first = session.confirm(entry.server_side_tuple().clone());
                entry.link_session(session.session_id());
                if first {
                    self.log_nat_event(session.session_id(), entry.server_side_tuple());
                }
            }
        }

        self.sessions.insert(ctid, Arc::clone(&session));

        let mut columns = HashMap::new();
        columns.insert("session_id".to_string(), json!(session.session_id()));
        columns.insert("ip_protocol".to_string(), json!(tuple.protocol));
        columns.insert("client_addr".to_string(), json!(tuple.client_addr.to_string()));
        columns.insert("server_addr".to_string(), json!(tuple.server_addr.to_string()));
        columns.insert("client_port".to_string(), json!(tuple.client_port));
        columns.insert("server_port".to_string(), json!(tuple.server_port));
        self.reports.log_event(crate::reports::create_event(
            "session_new",
            "sessions",
            1,
            columns,
            HashMap::new(),
        ));

        session
    }

    /// Run handler waves and aggregate verdicts
    ///
    /// Waves walk priorities in ascending order; every handler in a
    /// wave runs as its own task and reports through one bounded
    /// channel. Mark bits combine by OR; a release removes that
    /// handler's subscription from the session. Handlers released
    /// during this event still count as called for their own wave.
    async fn run_nfqueue_waves(
        &self,
        session: &Arc<SessionEntry>,
        message: NfqueueMessage,
        ctid: u32,
        new_session: bool,
        mut pmark: u32,
    ) -> u32 {
        let subtotal = session.subscription_count();
        if subtotal == 0 {
            return pmark;
        }

        let (pipe, mut results) = mpsc::channel::<NfqueueResult>(subtotal);
        let mut subcount = 0;
        let mut priority = 0;

        while subcount < subtotal {
            // A concurrent event may have released subscriptions from
            // under us; stop once nothing above this priority remains.
            match session.max_subscription_priority() {
                Some(max) if priority <= max => {}
                _ => break,
            }

            let mut hitcount = 0;
            for sub in session.subscriptions_at(priority) {
                debug!("calling nfqueue APP:{} PRIORITY:{}", sub.owner, priority);
                let pipe = pipe.clone();
                let message = message.clone();
                tokio::spawn(async move {
                    let _ = pipe.send(sub.handler.handle(message, ctid, new_session).await).await;
                });
                hitcount += 1;
                subcount += 1;
            }

            for _ in 0..hitcount {
                if let Some(result) = results.recv().await {
                    pmark |= result.packet_mark;
                    if result.session_release {
                        debug!(
                            "removing {} session nfqueue subscription for {}",
                            result.owner, ctid
                        );
                        session.remove_subscription(&result.owner);
                    }
                }
            }

            priority += 1;
        }

        pmark
    }
}
