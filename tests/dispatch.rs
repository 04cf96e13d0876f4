//! End-to-end dispatch scenarios
//!
//! Exercises the full path from kernel callbacks through session
//! resolution, handler waves, plugins, and the sweep, observing the
//! dictionary and report sinks.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use flowsentry::config::ClassifyConfig;
use flowsentry::dict::InMemoryDictionary;
use flowsentry::dispatch::{
    ConntrackEvent, ConntrackEventKind, ConntrackHandler, Dispatch, DispatchSettings,
    NfqueueHandler, NfqueueMessage, NfqueueResult,
};
use flowsentry::plugins::classify::ClassifyPlugin;
use flowsentry::plugins::sni::SniPlugin;
use flowsentry::plugins::{Plugin, PluginContext};
use flowsentry::reports::MemorySink;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn setup() -> (Arc<Dispatch>, Arc<InMemoryDictionary>, Arc<MemorySink>) {
    let dict = InMemoryDictionary::new();
    let reports = MemorySink::new();
    let dispatch = Dispatch::startup(DispatchSettings::default(), dict.clone(), reports.clone());
    (dispatch, dict, reports)
}

fn plugin_context(
    dispatch: &Arc<Dispatch>,
    dict: &Arc<InMemoryDictionary>,
    reports: &Arc<MemorySink>,
) -> PluginContext {
    PluginContext {
        dispatch: Arc::clone(dispatch),
        dict: dict.clone(),
        reports: reports.clone(),
    }
}

/// Raw IPv4 + TCP packet
fn tcp_packet(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let total_len = (20 + 20 + payload.len()) as u16;
    let mut pkt = vec![
        0x45, 0x00,
        (total_len >> 8) as u8,
        (total_len & 0xff) as u8,
        0x12, 0x34,
        0x40, 0x00,
        0x40, // TTL
        0x06, // TCP
        0x00, 0x00,
    ];
    pkt.extend_from_slice(&src);
    pkt.extend_from_slice(&dst);
    pkt.extend_from_slice(&[
        (src_port >> 8) as u8,
        (src_port & 0xff) as u8,
        (dst_port >> 8) as u8,
        (dst_port & 0xff) as u8,
        0x00, 0x00, 0x00, 0x01,
        0x00, 0x00, 0x00, 0x00,
        0x50, 0x18, // PSH+ACK
        0xff, 0xff,
        0x00, 0x00,
        0x00, 0x00,
    ]);
    pkt.extend_from_slice(payload);
    pkt
}

fn conntrack_new(ctid: u32) -> ConntrackEvent {
    ConntrackEvent {
        ctid,
        kind: ConntrackEventKind::New,
        protocol: 6,
        client_addr: "10.0.0.1".parse().unwrap(),
        server_addr: "1.2.3.4".parse().unwrap(),
        client_port: 5000,
        server_port: 443,
        nat_client_addr: "10.0.0.1".parse().unwrap(),
        nat_server_addr: "1.2.3.4".parse().unwrap(),
        nat_client_port: 5000,
        nat_server_port: 443,
        c2s_bytes: 0,
        s2c_bytes: 0,
    }
}

struct CountingHandler {
    owner: &'static str,
    mark: u32,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl NfqueueHandler for CountingHandler {
    async fn handle(&self, _message: NfqueueMessage, _ctid: u32, _new: bool) -> NfqueueResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        NfqueueResult {
            owner: self.owner.to_string(),
            packet_mark: self.mark,
            session_release: false,
        }
    }
}

struct CountingConntrackHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ConntrackHandler for CountingConntrackHandler {
    async fn handle(
        &self,
        _kind: ConntrackEventKind,
        _entry: Arc<flowsentry::dispatch::ConntrackEntry>,
    ) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// scenario A: conntrack NEW then matching nfqueue packet
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conntrack_new_then_packet_confirms_session() {
    let (dispatch, _dict, reports) = setup();

    dispatch.conntrack_event(conntrack_new(100)).await;

    let packet = tcp_packet([10, 0, 0, 1], [1, 2, 3, 4], 5000, 443, b"");
    dispatch.nfqueue_event(100, &packet, 0).await;

    let session = dispatch.find_session(100).expect("session exists");
    assert!(session.session_id() > 0);
    assert!(session.conntrack_confirmed());
    assert!(session.server_side_tuple().is_set());

    let nat_events = reports.events_named("session_nat");
    assert_eq!(nat_events.len(), 1);
    assert_eq!(nat_events[0].columns["session_id"], json!(session.session_id()));

    assert_eq!(reports.events_named("session_new").len(), 1);
    dispatch.shutdown().await;
}

// ---------------------------------------------------------------------------
// scenario A': packet first, then conntrack NEW
// ---------------------------------------------------------------------------

#[tokio::test]
async fn packet_then_conntrack_new_confirms_session() {
    let (dispatch, _dict, reports) = setup();

    let packet = tcp_packet([10, 0, 0, 1], [1, 2, 3, 4], 5000, 443, b"");
    dispatch.nfqueue_event(100, &packet, 0).await;
    assert!(!dispatch.find_session(100).unwrap().conntrack_confirmed());

    dispatch.conntrack_event(conntrack_new(100)).await;

    let session = dispatch.find_session(100).unwrap();
    assert!(session.conntrack_confirmed());
    assert_eq!(reports.events_named("session_nat").len(), 1);
    dispatch.shutdown().await;
}

// ---------------------------------------------------------------------------
// scenario B: SNI plugin gives up after five hopeless packets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sni_releases_after_five_packets_without_handshake() {
    let (dispatch, dict, reports) = setup();
    let sni = SniPlugin::new(plugin_context(&dispatch, &dict, &reports));
    sni.startup().await.unwrap();

    // payload long enough to scan but never a TLS handshake
    let payload = vec![0x41u8; 64];
    let packet = tcp_packet([10, 0, 0, 2], [1, 2, 3, 4], 5001, 443, &payload);

    for i in 1..=5u64 {
        dispatch.nfqueue_event(200, &packet, 0).await;
        let session = dispatch.find_session(200).unwrap();
        assert_eq!(session.packet_count(), i);
        if i < 5 {
            assert!(session.has_subscription("sni"), "released early at packet {}", i);
        }
    }

    let session = dispatch.find_session(200).unwrap();
    assert!(!session.has_subscription("sni"));
    assert_eq!(dict.get(200, "ssl_sni"), None);
    assert!(reports.events_named("session_sni").is_empty());
    dispatch.shutdown().await;
}

#[tokio::test]
async fn sni_extracts_hostname_from_client_hello() {
    let (dispatch, dict, reports) = setup();
    let sni = SniPlugin::new(plugin_context(&dispatch, &dict, &reports));
    sni.startup().await.unwrap();

    let packet = tcp_packet([10, 0, 0, 3], [1, 2, 3, 4], 5002, 443, &client_hello("example.org"));
    dispatch.nfqueue_event(201, &packet, 0).await;

    assert_eq!(dict.get(201, "ssl_sni"), Some(json!("example.org")));
    assert_eq!(reports.events_named("session_sni").len(), 1);
    assert!(!dispatch.find_session(201).unwrap().has_subscription("sni"));
    dispatch.shutdown().await;
}

/// Minimal TLS ClientHello carrying a server_name extension
fn client_hello(hostname: &str) -> Vec<u8> {
    let name = hostname.as_bytes();
    let list_len = name.len() + 3;

    let mut extensions: Vec<u8> = Vec::new();
    extensions.extend_from_slice(&[0x00, 0x00]);
    extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
    extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
    extensions.push(0x00);
    extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
    extensions.extend_from_slice(name);

    let mut hello = vec![
        0x16, 0x03, 0x01, 0x00, 0x00, // handshake record, TLS 1.0
        0x01, 0x00, 0x00, 0x00, // ClientHello
        0x03, 0x03, // client version
    ];
    hello.extend_from_slice(&[0u8; 32]); // epoch + random
    hello.push(0x00); // session id length
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher suites
    hello.extend_from_slice(&[0x01, 0x00]); // compression methods
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);
    hello
}

// ---------------------------------------------------------------------------
// scenario C: classifier confidence monotonicity over a live socket
// ---------------------------------------------------------------------------

#[tokio::test]
async fn classifier_ignores_lower_confidence_reply() {
    let (dispatch, dict, reports) = setup();

    // mock categorisation daemon: two canned replies on one connection
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connected_tx, mut connected_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = connected_tx.send(()).await;
        let replies: [&[u8]; 2] = [
            b"APPLICATION: /FOO\r\nPROTOCHAIN: /IP/TCP/FOO\r\nDETAIL: stream\r\nCONFIDENCE: 80\r\nSTATE: 1\r\n\r\n",
            b"CONFIDENCE: 20\r\nSTATE: 3\r\n\r\n",
        ];
        let mut buffer = vec![0u8; 4096];
        for reply in replies {
            let n = socket.read(&mut buffer).await.unwrap();
            if n == 0 {
                return;
            }
            socket.write_all(reply).await.unwrap();
        }
    });

    // application table mapping /FOO to a name and category
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv, "guid,index,name,description,category,productivity,risk,flags,reference,plugin").unwrap();
    writeln!(csv, "/FOO,1,FooStream,Streaming,Media,2,3,0,ref,classd").unwrap();

    let config = ClassifyConfig {
        enabled: true,
        host_port: addr.to_string(),
        daemon_binary: None,
        application_table: csv.path().display().to_string(),
    };
    let classify = ClassifyPlugin::new(plugin_context(&dispatch, &dict, &reports), config);
    classify.startup().await.unwrap();

    // the socket manager connects in the background; wait for the mock
    // daemon to accept before sending traffic
    tokio::time::timeout(Duration::from_secs(5), connected_rx.recv())
        .await
        .expect("socket manager connected");

    let packet = tcp_packet([10, 0, 0, 4], [1, 2, 3, 4], 5003, 80, b"GET / HTTP/1.1");
    dispatch.nfqueue_event(300, &packet, 0).await;

    let session = dispatch.find_session(300).expect("session exists");
    assert_eq!(
        session.get_attachment("application_confidence").and_then(|v| v.as_uint()),
        Some(80)
    );
    assert_eq!(dict.get(300, "application_name"), Some(json!("FooStream")));
    assert_eq!(dict.get(300, "application_category"), Some(json!("Media")));
    let first_events = reports.events_named("session_classify");
    assert_eq!(first_events.len(), 1);
    assert_eq!(first_events[0].modified_columns.len(), 6);

    // STATE: 1 keeps the daemon inspecting, so the subscription stays
    assert!(session.has_subscription("classify"));

    // the second reply is lower confidence with a classified state
    let packet2 = tcp_packet([10, 0, 0, 4], [1, 2, 3, 4], 5003, 80, b"more data");
    dispatch.nfqueue_event(300, &packet2, 0).await;

    // lower confidence: no change, no extra event; classified state
    // still releases the subscription
    assert_eq!(
        session.get_attachment("application_confidence").and_then(|v| v.as_uint()),
        Some(80)
    );
    assert_eq!(dict.get(300, "application_confidence"), Some(json!(80)));
    assert_eq!(reports.events_named("session_classify").len(), 1);
    assert!(!session.has_subscription("classify"));

    classify.shutdown().await;
    dispatch.shutdown().await;
}

// ---------------------------------------------------------------------------
// scenario D: conntrack UPDATE counter regression
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_regression_resets_counters_and_skips_fanout() {
    let (dispatch, _dict, _reports) = setup();

    let calls = Arc::new(AtomicUsize::new(0));
    dispatch.register_conntrack_subscription(
        "observer",
        0,
        Arc::new(CountingConntrackHandler { calls: calls.clone() }),
    );

    dispatch.conntrack_event(conntrack_new(400)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut update = conntrack_new(400);
    update.kind = ConntrackEventKind::Update;
    update.c2s_bytes = 2000;
    update.s2c_bytes = 100;
    dispatch.conntrack_event(update.clone()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // counters went down: tuple re-use, reset and stay quiet
    update.c2s_bytes = 1000;
    update.s2c_bytes = 500;
    dispatch.conntrack_event(update).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let entry = dispatch.find_conntrack(400).expect("conntrack entry");
    let counters = entry.counters();
    assert_eq!(counters.c2s_bytes, 1000);
    assert_eq!(counters.s2c_bytes, 500);
    // rates still reflect the last clean update (integer division by 60)
    assert_eq!(counters.c2s_rate, 33.0);
    dispatch.shutdown().await;
}

// ---------------------------------------------------------------------------
// scenario E: concurrent nfqueue events for the same ctid
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_events_combine_marks_without_duplicate_calls() {
    let (dispatch, _dict, _reports) = setup();

    let calls = Arc::new(AtomicUsize::new(0));
    dispatch.register_nfqueue_subscription(
        "marker",
        0,
        Arc::new(CountingHandler {
            owner: "marker",
            mark: 0x8,
            calls: calls.clone(),
        }),
    );

    let packet = tcp_packet([10, 0, 0, 5], [1, 2, 3, 4], 5005, 80, b"");
    let (mark_a, mark_b) = tokio::join!(
        dispatch.nfqueue_event(500, &packet, 0x1),
        dispatch.nfqueue_event(500, &packet, 0x2),
    );

    assert_eq!(mark_a, 0x1 | 0x8);
    assert_eq!(mark_b, 0x2 | 0x8);
    // one handler invocation per packet, never two
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    dispatch.shutdown().await;
}

// ---------------------------------------------------------------------------
// scenario F: sweep expires idle sessions and clears the dictionary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_expires_idle_session_and_dictionary() {
    let (dispatch, dict, _reports) = setup();

    let packet = tcp_packet([10, 0, 0, 6], [1, 2, 3, 4], 5006, 80, b"");
    dispatch.nfqueue_event(600, &packet, 0).await;
    assert_eq!(dict.get(600, "session_id").is_some(), true);

    dispatch
        .find_session(600)
        .unwrap()
        .set_idle_for(Duration::from_secs(601));
    dispatch.clean_tables();

    assert!(dispatch.find_session(600).is_none());
    assert_eq!(dict.get(600, "session_id"), None);
    assert_eq!(dict.session_count(), 0);
    dispatch.shutdown().await;
}

// ---------------------------------------------------------------------------
// invariant 3: ctid re-use on a confirmed session is fatal
// ---------------------------------------------------------------------------

#[tokio::test]
#[should_panic(expected = "conntrack id re-use detected")]
async fn ctid_reuse_on_confirmed_session_panics() {
    let (dispatch, _dict, _reports) = setup();

    let packet = tcp_packet([10, 0, 0, 1], [1, 2, 3, 4], 5000, 443, b"");
    dispatch.nfqueue_event(700, &packet, 0).await;
    dispatch.conntrack_event(conntrack_new(700)).await;
    assert!(dispatch.find_session(700).unwrap().conntrack_confirmed());

    // same ctid, different flow, confirmed session: must abort
    let other = tcp_packet([10, 9, 9, 9], [1, 2, 3, 4], 6000, 443, b"");
    dispatch.nfqueue_event(700, &other, 0).await;
}
