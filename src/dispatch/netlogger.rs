//! Netlogger event handling
//!
//! Log-target events fan out unchanged to netlogger subscribers in
//! priority waves; no table is touched and nothing is returned.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use super::Dispatch;

/// One log-target event as delivered by the kernel binding
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetloggerMessage {
    pub version: u8,
    pub protocol: u8,
    pub icmp_type: u16,
    pub src_intf: u8,
    pub dst_intf: u8,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub mark: u32,
    pub prefix: String,
}

impl Dispatch {
    /// Kernel netlogger callback
    pub async fn netlogger_event(&self, message: NetloggerMessage) {
        trace!("netlogger event: {:?}", message);
        let message = Arc::new(message);

        let sublist = self.netlogger_subscriptions.snapshot_list();
        let subtotal = sublist.len();
        let Some(max_priority) = sublist.iter().map(|s| s.priority).max() else {
            return;
        };

        let mut subcount = 0;
        let mut priority = 0;

        while subcount < subtotal && priority <= max_priority {
            let mut wave = JoinSet::new();
            for sub in sublist.iter().filter(|s| s.priority == priority) {
                debug!("calling netlogger APP:{} PRIORITY:{}", sub.owner, priority);
                let handler = Arc::clone(&sub.handler);
                let message = Arc::clone(&message);
                wave.spawn(async move {
                    handler.handle(message).await;
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
    use crate::dict::InMemoryDictionary;
    use crate::dispatch::registry::NetloggerHandler;
    use crate::dispatch::DispatchSettings;
    use crate::reports::MemorySink;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, String)>>>,
    }

    #[async_trait]
    impl NetloggerHandler for Recorder {
        async fn handle(&self, message: Arc<NetloggerMessage>) {
            self.seen.lock().push((self.name, message.prefix.clone()));
        }
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_priorities() {
        let dispatch = Dispatch::startup(
            DispatchSettings::default(),
            InMemoryDictionary::new(),
            MemorySink::new(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatch.register_netlogger_subscription(
            "second",
            1,
            Arc::new(Recorder { name: "second", seen: Arc::clone(&seen) }),
        );
        dispatch.register_netlogger_subscription(
            "first",
            0,
            Arc::new(Recorder { name: "first", seen: Arc::clone(&seen) }),
        );

        dispatch
            .netlogger_event(NetloggerMessage {
                prefix: "drop".to_string(),
                ..Default::default()
            })
            .await;

        let seen = seen.lock();
        assert_eq!(*seen, vec![("first", "drop".to_string()), ("second", "drop".to_string())]);
    }
}
