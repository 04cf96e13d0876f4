//! Application classifier plugin
//!
//! Sends each packet to an external categorisation daemon over a TCP
//! line protocol and attaches the returned classification to the
//! session. Results flow into the session attachments, the per-session
//! dictionary, and `session_classify` report events. The session is
//! released once the daemon settles on a verdict or enough traffic has
//! been inspected.

pub mod apptable;
mod daemon;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};

use self::apptable::{load_application_table, ApplicationInfo};
use self::daemon::{ClassdClient, DaemonManager};
use super::{Plugin, PluginContext, CLASSIFY_PRIORITY};
use crate::config::ClassifyConfig;
use crate::dispatch::{AttachValue, NfqueueHandler, NfqueueMessage, NfqueueResult, SessionEntry};
use crate::dict::SessionDictionary;
use crate::reports::create_event;

const PLUGIN_NAME: &str = "classify";

// Connection states reported by the daemon
pub const STATE_TERMINATED: i64 = 0;
pub const STATE_INSPECTING: i64 = 1;
pub const STATE_MONITORING: i64 = 2;
pub const STATE_CLASSIFIED: i64 = 3;

/// Stop inspecting after this many packets
const MAX_PACKET_COUNT: u64 = 64;
/// Stop inspecting after this much traffic
const MAX_TRAFFIC_SIZE: u64 = 0x10000;

/// Parsed daemon reply
#[derive(Debug, Default, Clone, PartialEq)]
struct ClassdReply {
    application: String,
    protochain: String,
    detail: String,
    confidence: u64,
    state: i64,
}

pub struct ClassifyPlugin {
    ctx: PluginContext,
    config: ClassifyConfig,
    app_table: RwLock<HashMap<String, ApplicationInfo>>,
    client: Arc<ClassdClient>,
    manager: tokio::sync::Mutex<Option<DaemonManager>>,
}

impl ClassifyPlugin {
    pub fn new(ctx: PluginContext, config: ClassifyConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            app_table: RwLock::new(HashMap::new()),
            client: ClassdClient::new(),
            manager: tokio::sync::Mutex::new(None),
        })
    }
}

#[async_trait]
impl Plugin for ClassifyPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn startup(&self) -> Result<()> {
        info!("plugin startup ({})", PLUGIN_NAME);

        *self.app_table.write() =
            load_application_table(PathBuf::from(&self.config.application_table).as_path());

        let binary = self.config.daemon_binary.as_ref().map(PathBuf::from);
        if let Some(binary) = &binary {
            if !binary.exists() {
                warn!(
                    "classify daemon binary {} not found; expecting external daemon",
                    binary.display()
                );
            }
        }

        *self.manager.lock().await = Some(DaemonManager::start(
            Arc::clone(&self.client),
            binary.filter(|b| b.exists()),
            self.config.host_port.clone(),
        ));

        self.ctx.dispatch.register_nfqueue_subscription(
            PLUGIN_NAME,
            CLASSIFY_PRIORITY,
            Arc::new(ClassifyHandler {
                ctx: self.ctx.clone(),
                app_table: self.app_table.read().clone(),
                client: Arc::clone(&self.client),
            }),
        );
        Ok(())
    }

    async fn shutdown(&self) {
        info!("plugin shutdown ({})", PLUGIN_NAME);
        let guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            manager.shutdown_task(&manager.socket_tx, "classify socket manager").await;
            manager.shutdown_task(&manager.process_tx, "classify process manager").await;
        }
    }
}

/// The nfqueue-facing half of the plugin
pub(crate) struct ClassifyHandler {
    ctx: PluginContext,
    app_table: HashMap<String, ApplicationInfo>,
    client: Arc<ClassdClient>,
}

impl ClassifyHandler {
    #[cfg(test)]
    pub(crate) fn for_test(
        ctx: PluginContext,
        app_table: HashMap<String, ApplicationInfo>,
        client: Arc<ClassdClient>,
    ) -> Self {
        Self { ctx, app_table, client }
    }
}

#[async_trait]
impl NfqueueHandler for ClassifyHandler {
    async fn handle(&self, message: NfqueueMessage, ctid: u32, _new_session: bool) -> NfqueueResult {
        let mut result = NfqueueResult {
            owner: PLUGIN_NAME.to_string(),
            packet_mark: 0,
            session_release: true,
        };

        let session = &message.session;
        if session.session_id() == 0 {
            warn!("ignoring event with invalid session id");
            return result;
        }

        let proto = if message.packet.is_ipv4() {
            "IP4"
        } else if message.packet.is_ipv6() {
            "IP6"
        } else {
            warn!("unsupported protocol for {}", ctid);
            return result;
        };

        let command = format!(
            "PACKET|{}|{}|{}\r\n",
            session.session_id(),
            proto,
            message.packet.raw.len()
        );
        let reply = self.client.classify_packet(&command, &message.packet.raw).await;

        // an empty reply means the daemon is unreachable; release this
        // plugin's subscription and leave the rest of the pipeline alone
        if reply.is_empty() {
            return result;
        }

        let (state, confidence) = self.process_reply(&reply, session, ctid);

        let release = state == STATE_CLASSIFIED
            || state == STATE_TERMINATED
            || session.packet_count() > MAX_PACKET_COUNT
            || session.byte_count() > MAX_TRAFFIC_SIZE;

        if release {
            debug!(
                "releasing session:{} state:{} confidence:{} packets:{} bytes:{}",
                ctid,
                state,
                confidence,
                session.packet_count(),
                session.byte_count()
            );
        }

        result.session_release = release;
        result
    }
}

impl ClassifyHandler {
    /// Apply a daemon reply to the session
    ///
    /// The whole update runs under one attachment lock so concurrent
    /// replies cannot interleave. The accessor methods on the session
    /// must not be called from here; they take the same lock.
    fn process_reply(&self, reply: &str, session: &Arc<SessionEntry>, ctid: u32) -> (i64, u64) {
        let parsed = parse_reply(reply);
        let (name, category) = match self.app_table.get(&parsed.application) {
            Some(info) => (info.name.clone(), info.category.clone()),
            None => (String::new(), String::new()),
        };

        let mut attachments = session.lock_attachments();

        // Replies can arrive out of order relative to the daemon's own
        // pipeline. A lower-confidence update never overwrites a
        // higher-confidence one, and a shorter protochain never
        // overwrites a longer one.
        if let Some(current) = attachments.get("application_confidence").and_then(|v| v.as_uint()) {
            if parsed.confidence < current {
                debug!(
                    "ignoring update with confidence {} < {} state:{}",
                    parsed.confidence, current, parsed.state
                );
                return (parsed.state, parsed.confidence);
            }
        }
        if let Some(current) = attachments.get("application_protochain").and_then(|v| v.as_str()) {
            if count_links(&parsed.protochain) < count_links(current) {
                debug!(
                    "ignoring update with protochain {} < {} state:{}",
                    parsed.protochain, current, parsed.state
                );
                return (parsed.state, parsed.confidence);
            }
        }

        let dict = &self.ctx.dict;
        let mut changed = Vec::new();
        let updates = [
            ("application_id", AttachValue::Str(parsed.application.clone())),
            ("application_name", AttachValue::Str(name)),
            ("application_protochain", AttachValue::Str(parsed.protochain.clone())),
            ("application_detail", AttachValue::Str(parsed.detail.clone())),
            ("application_confidence", AttachValue::UInt(parsed.confidence)),
            ("application_category", AttachValue::Str(category)),
        ];
        for (key, value) in updates {
            if update_classify_detail(&mut attachments, dict, ctid, key, value) {
                changed.push(key);
            }
        }

        if !changed.is_empty() {
            let mut columns = HashMap::new();
            columns.insert("session_id".to_string(), json!(session.session_id()));
            let mut modified = HashMap::new();
            for key in &changed {
                if let Some(value) = attachments.get(*key) {
                    modified.insert(key.to_string(), value.to_json());
                }
            }
            self.ctx.reports.log_event(create_event(
                "session_classify",
                "sessions",
                2,
                columns,
                modified,
            ));
        }

        (parsed.state, parsed.confidence)
    }
}

/// Depth of a protochain like /IP/TCP/FOO
fn count_links(protochain: &str) -> usize {
    protochain.matches('/').count()
}

/// Write one classification detail if it changed
///
/// Empty strings never overwrite. Changes are mirrored into the
/// per-session dictionary. Returns true when the stored value changed.
fn update_classify_detail(
    attachments: &mut HashMap<String, AttachValue>,
    dict: &Arc<dyn SessionDictionary>,
    ctid: u32,
    key: &str,
    value: AttachValue,
) -> bool {
    if let AttachValue::Str(s) = &value {
        if s.is_empty() {
            return false;
        }
    }

    match attachments.get(key) {
        None => {
            dict.add_session_entry(ctid, key, value.to_json());
            debug!("setting classification detail {} = {:?} ctid:{}", key, value, ctid);
            attachments.insert(key.to_string(), value);
            true
        }
        Some(current) if *current == value => false,
        Some(current) => {
            debug!(
                "updating classification detail {} from {:?} to {:?} ctid:{}",
                key, current, value, ctid
            );
            dict.add_session_entry(ctid, key, value.to_json());
            attachments.insert(key.to_string(), value);
            true
        }
    }
}

/// Parse the daemon's CRLF-delimited `KEY: value` reply lines
///
/// Unrecognised lines are ignored; malformed integers default to zero.
fn parse_reply(reply: &str) -> ClassdReply {
    let mut parsed = ClassdReply::default();

    for line in reply.split("\r\n") {
        if line.len() < 3 {
            continue;
        }
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        match key {
            "APPLICATION" => parsed.application = value.to_string(),
            "PROTOCHAIN" => parsed.protochain = value.to_string(),
            "DETAIL" => parsed.detail = value.to_string(),
            "CONFIDENCE" => parsed.confidence = value.trim().parse().unwrap_or(0),
            "STATE" => parsed.state = value.trim().parse().unwrap_or(0),
            _ => {}
        }
    }

    parsed
}
