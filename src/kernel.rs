//! Kernel queue binding
//!
//! Thin glue between the netfilter queue and the dispatch core. The
//! queue is read on a blocking thread; each packet is pushed through
//! `Dispatch::nfqueue_event` and accepted back to the kernel. The
//! full production binding also delivers conntrack and netlogger
//! streams plus the kernel's own conntrack id; this loop stands in
//! with a stable id derived from the flow tuple so the dispatch
//! contract stays identical.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use nfq::{Queue, Verdict};
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::core::parse_ip_packet;
use crate::dispatch::Dispatch;
use crate::warehouse::WarehouseWriter;

/// Derive a stable 32-bit flow id from the packet's tuple
///
/// Stand-in for the conntrack-id attribute the production binding
/// reads from the kernel; identical tuples map to the same id for the
/// lifetime of the process.
fn flow_ctid(data: &[u8]) -> u32 {
    let mut hasher = DefaultHasher::new();
    match parse_ip_packet(data) {
        Ok(packet) => packet.tuple().hash(&mut hasher),
        Err(_) => data.hash(&mut hasher),
    }
    hasher.finish() as u32
}

/// Run the live queue loop until the shutdown flag is set
///
/// Must be called from within a tokio runtime; the queue itself is
/// serviced on a dedicated blocking thread.
pub async fn run_live_queue(
    dispatch: Arc<Dispatch>,
    queue_num: u16,
    capture: Option<Arc<WarehouseWriter>>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let handle = Handle::current();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut queue = Queue::open().context("Failed to open NFQUEUE")?;
        queue
            .bind(queue_num)
            .with_context(|| format!("Failed to bind to NFQUEUE {}", queue_num))?;

        info!("bound to NFQUEUE {}", queue_num);

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("queue loop stopping");
                return Ok(());
            }

            match queue.recv() {
                Ok(mut msg) => {
                    let data = msg.get_payload().to_vec();
                    let ctid = flow_ctid(&data);

                    if let Some(writer) = &capture {
                        writer.record(ctid, 0, &data);
                    }

                    let mark = handle.block_on(dispatch.nfqueue_event(ctid, &data, 0));
                    debug!("nfqueue verdict ctid:{} mark:{:#x}", ctid, mark);

                    msg.set_verdict(Verdict::Accept);
                    if let Err(err) = queue.verdict(msg) {
                        error!("failed to send verdict: {}", err);
                    }
                }
                Err(err) => {
                    error!("NFQUEUE recv error: {}", err);
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
            }
        }
    })
    .await
    .context("queue loop panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::tests::make_tcp_packet;

    #[test]
    fn test_flow_ctid_is_stable() {
        let a = make_tcp_packet([10, 0, 0, 1], [1, 2, 3, 4], 5000, 443, b"x");
        let b = make_tcp_packet([10, 0, 0, 1], [1, 2, 3, 4], 5000, 443, b"completely different");
        assert_eq!(flow_ctid(&a), flow_ctid(&b));
    }

    #[test]
    fn test_flow_ctid_differs_per_flow() {
        let a = make_tcp_packet([10, 0, 0, 1], [1, 2, 3, 4], 5000, 443, b"");
        let b = make_tcp_packet([10, 0, 0, 2], [1, 2, 3, 4], 5000, 443, b"");
        assert_ne!(flow_ctid(&a), flow_ctid(&b));
    }
}
