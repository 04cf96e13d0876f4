//! TLS server-name plugin
//!
//! Watches TCP traffic on port 443 for a TLS ClientHello and extracts
//! the server-name extension. On success the hostname is written to
//! the session dictionary as `ssl_sni` and a `session_sni` event is
//! reported; either way the session is released once a decision is
//! reached.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::{Plugin, PluginContext, SNI_PRIORITY};
use crate::dispatch::{NfqueueHandler, NfqueueMessage, NfqueueResult};
use crate::reports::create_event;

const PLUGIN_NAME: &str = "sni";

/// Give up after this many packets without a ClientHello
const MAX_PACKET_COUNT: u64 = 5;

pub struct SniPlugin {
    ctx: PluginContext,
}

impl SniPlugin {
    pub fn new(ctx: PluginContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }
}

#[async_trait]
impl Plugin for SniPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn startup(&self) -> Result<()> {
        info!("plugin startup ({})", PLUGIN_NAME);
        self.ctx.dispatch.register_nfqueue_subscription(
            PLUGIN_NAME,
            SNI_PRIORITY,
            Arc::new(SniHandler { ctx: self.ctx.clone() }),
        );
        Ok(())
    }

    async fn shutdown(&self) {
        info!("plugin shutdown ({})", PLUGIN_NAME);
    }
}

pub(crate) struct SniHandler {
    pub(crate) ctx: PluginContext,
}

impl SniHandler {
    fn log_event(&self, session_id: u64, hostname: &str) {
        let mut columns = HashMap::new();
        columns.insert("session_id".to_string(), json!(session_id));
        let mut modified = HashMap::new();
        modified.insert("ssl_sni".to_string(), json!(hostname));
        self.ctx
            .reports
            .log_event(create_event("session_sni", "sessions", 2, columns, modified));
    }
}

#[async_trait]
impl NfqueueHandler for SniHandler {
    async fn handle(&self, message: NfqueueMessage, ctid: u32, _new_session: bool) -> NfqueueResult {
        let mut result = NfqueueResult {
            owner: PLUGIN_NAME.to_string(),
            packet_mark: 0,
            session_release: false,
        };

        // SNI only lives in TCP traffic
        if !message.packet.is_tcp() {
            result.session_release = true;
            return result;
        }

        // The client and server ports flip depending on direction, so
        // accept either side at 443 while the handshake completes.
        if message.tuple.server_port != 443 && message.tuple.client_port != 443 {
            result.session_release = true;
            return result;
        }

        let (release, hostname) = extract_sni_hostname(message.packet.payload());

        if let Some(hostname) = hostname {
            debug!("extracted SNI {} ctid:{}", hostname, ctid);
            self.ctx.dict.add_session_entry(ctid, "ssl_sni", json!(hostname));
            self.log_event(message.session.session_id(), &hostname);
            result.session_release = true;
            return result;
        }

        // give up if the handshake never shows within the first packets
        if message.session.packet_count() >= MAX_PACKET_COUNT {
            debug!("exceeded SNI packet limit ctid:{}", ctid);
            result.session_release = true;
            return result;
        }

        result.session_release = release;
        result
    }
}

/*

TLS ClientHello layout walked below:

Size   Description                  Offset
----------------------------------------------------
1      Record Content Type          0
2      SSL Version                  1
2      Record Length                3
1      Handshake Type               5
3      Message Length               6
2      Client Preferred Version     9
4      Client Epoch GMT             11
28     Random Bytes                 15
1      Session ID Length            43
0+     Session ID Data
2      Cipher Suites Length
0+     Cipher Suites Data
1      Compression Methods Length
0+     Compression Methods Data
2      Extensions Length
0+     Extensions Data

*/

fn read_u8(buffer: &[u8], at: usize) -> Option<usize> {
    buffer.get(at).map(|b| *b as usize)
}

fn read_u16(buffer: &[u8], at: usize) -> Option<usize> {
    let hi = *buffer.get(at)? as usize;
    let lo = *buffer.get(at + 1)? as usize;
    Some((hi << 8) + lo)
}

/// Scan a payload for the SNI hostname
///
/// The first bool is the release decision: false while the payload is
/// not a plausible ClientHello (keep watching), true once it is, since
/// a valid ClientHello settles the question whether or not a hostname
/// is present. Any boundary overrun returns without a hostname.
pub(crate) fn extract_sni_hostname(buffer: &[u8]) -> (bool, Option<String>) {
    // too short to hold a ClientHello
    if buffer.len() < 48 {
        return (false, None);
    }

    // TLS handshake record
    if buffer[0] != 0x16 {
        return (false, None);
    }

    // SSLv3 or later
    if buffer[1] != 0x03 {
        return (false, None);
    }

    // TLS 1.0 or greater
    if buffer[2] < 0x01 {
        return (false, None);
    }

    // ClientHello message type
    if buffer[5] != 0x01 {
        return (false, None);
    }

    // From here on this is a ClientHello, so the session is released
    // regardless of whether a hostname turns up.

    // skip over the session id
    let mut current = 43;
    let Some(session_id_len) = read_u8(buffer, current) else {
        return (true, None);
    };
    current += 1 + session_id_len;

    // skip over the cipher suites
    let Some(cipher_suite_len) = read_u16(buffer, current) else {
        return (true, None);
    };
    current += 2 + cipher_suite_len;

    // skip over the compression methods
    let Some(compression_len) = read_u8(buffer, current) else {
        return (true, None);
    };
    current += 1 + compression_len;

    let Some(extensions_len) = read_u16(buffer, current) else {
        return (true, None);
    };
    current += 2;

    if extensions_len == 0 {
        return (true, None);
    }

    while current < buffer.len() {
        let Some(extension_type) = read_u16(buffer, current) else {
            return (true, None);
        };
        current += 2;

        let Some(extension_data_len) = read_u16(buffer, current) else {
            return (true, None);
        };
        current += 2;

        // everything except the server-name extension gets skipped
        if extension_type != 0 {
            current += extension_data_len;
            continue;
        }

        // skip the name-list length; there is only ever one entry
        let spot = current + 2;
        let Some(name_type) = read_u8(buffer, spot) else {
            return (true, None);
        };

        if name_type == 0 {
            let Some(name_len) = read_u16(buffer, spot + 1) else {
                return (true, None);
            };
            let start = spot + 3;
            let Some(name) = buffer.get(start..start + name_len) else {
                return (true, None);
            };
            return (true, Some(String::from_utf8_lossy(name).to_string()));
        }

        current += extension_data_len;
    }

    (true, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ClientHello with an optional server_name extension
    pub(crate) fn make_client_hello(hostname: Option<&str>) -> Vec<u8> {
        let mut extensions: Vec<u8> = Vec::new();
        if let Some(name) = hostname {
            let name = name.as_bytes();
            let list_len = name.len() + 3;
            extensions.extend_from_slice(&[0x00, 0x00]); // server_name type
            extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
            extensions.push(0x00); // host_name
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }
        // pad with a grease-ish extension so short hellos clear 48 bytes
        extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x02, 0x00, 0x1d]);

        let mut hello = vec![
            0x16, // handshake record
            0x03, 0x01, // TLS 1.0 record version
            0x00, 0x00, // record length (unchecked)
            0x01, // ClientHello
            0x00, 0x00, 0x00, // message length (unchecked)
            0x03, 0x03, // client version
        ];
        hello.extend_from_slice(&[0u8; 4]); // gmt epoch
        hello.extend_from_slice(&[0u8; 28]); // random
        hello.push(0x00); // session id length
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        hello.extend_from_slice(&[0x01, 0x00]); // one compression method
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);
        hello
    }

    #[test]
    fn test_extracts_hostname() {
        let hello = make_client_hello(Some("www.example.com"));
        let (release, hostname) = extract_sni_hostname(&hello);
        assert!(release);
        assert_eq!(hostname.as_deref(), Some("www.example.com"));
    }

    #[test]
    fn test_client_hello_without_sni_still_releases() {
        let hello = make_client_hello(None);
        let (release, hostname) = extract_sni_hostname(&hello);
        assert!(release);
        assert!(hostname.is_none());
    }

    #[test]
    fn test_non_handshake_does_not_release() {
        let mut hello = make_client_hello(Some("www.example.com"));
        hello[0] = 0x17; // application data, not a handshake
        let (release, hostname) = extract_sni_hostname(&hello);
        assert!(!release);
        assert!(hostname.is_none());
    }

    #[test]
    fn test_ssl2_version_rejected() {
        let mut hello = make_client_hello(Some("www.example.com"));
        hello[1] = 0x02;
        assert_eq!(extract_sni_hostname(&hello), (false, None));
    }

    #[test]
    fn test_short_payload_keeps_watching() {
        assert_eq!(extract_sni_hostname(&[0x16, 0x03, 0x01]), (false, None));
    }

    #[test]
    fn test_truncated_extension_returns_no_hostname() {
        let mut hello = make_client_hello(Some("www.example.com"));
        let cut = hello.len() - 10;
        hello.truncate(cut);
        // still a valid ClientHello prefix, so release stands, but the
        // hostname read runs out of buffer
        let (release, hostname) = extract_sni_hostname(&hello);
        assert!(release);
        assert!(hostname.is_none());
    }
}
