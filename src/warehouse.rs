//! Traffic warehouse: capture and playback
//!
//! Live nfqueue events can be captured to a file and replayed through
//! the dispatcher later, optionally speed-scaled. Each capture line is
//! one JSON record holding the millisecond offset from capture start,
//! the conntrack id, the packet's initial mark, and the raw bytes.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dispatch::Dispatch;

/// Single-character mode flag from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarehouseMode {
    Live,
    Capture,
    Playback,
}

impl WarehouseMode {
    pub fn from_flag(flag: char) -> Option<Self> {
        match flag {
            'L' => Some(WarehouseMode::Live),
            'C' => Some(WarehouseMode::Capture),
            'P' => Some(WarehouseMode::Playback),
            _ => None,
        }
    }
}

/// One captured nfqueue event
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CapturedEvent {
    offset_ms: u64,
    ctid: u32,
    pmark: u32,
    data: Vec<u8>,
}

/// Appends nfqueue events to a capture file
pub struct WarehouseWriter {
    file: Mutex<BufWriter<File>>,
    start: Instant,
}

impl WarehouseWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("Failed to create capture file: {}", path.as_ref().display()))?;
        info!("capturing traffic to {}", path.as_ref().display());
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
            start: Instant::now(),
        })
    }

    /// Record one event; serialization failures are logged, not fatal
    pub fn record(&self, ctid: u32, pmark: u32, data: &[u8]) {
        let event = CapturedEvent {
            offset_ms: self.start.elapsed().as_millis() as u64,
            ctid,
            pmark,
            data: data.to_vec(),
        };
        match serde_json::to_string(&event) {
            Ok(line) => {
                let mut file = self.file.lock();
                if let Err(err) = writeln!(file, "{}", line) {
                    warn!("capture write failed: {}", err);
                }
            }
            Err(err) => warn!("capture encode failed: {}", err),
        }
    }

    pub fn flush(&self) {
        if let Err(err) = self.file.lock().flush() {
            warn!("capture flush failed: {}", err);
        }
    }
}

impl Drop for WarehouseWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Playback statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub events: u64,
    pub skipped: u64,
}

/// Replay a capture file through the dispatcher
///
/// `speed` is a percentage: 100 replays with the recorded timing, 200
/// at double speed, 50 at half speed. Zero disables pacing entirely.
/// Undecodable lines are skipped with a warning.
pub async fn playback<P: AsRef<Path>>(
    path: P,
    speed: u32,
    dispatch: &Dispatch,
) -> Result<PlaybackStats> {
    let file = File::open(&path)
        .with_context(|| format!("Failed to open playback file: {}", path.as_ref().display()))?;
    info!("playing back traffic from {} at {}%", path.as_ref().display(), speed);

    let mut stats = PlaybackStats::default();
    let mut last_offset: u64 = 0;

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let event: CapturedEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!("skipping bad capture line: {}", err);
                stats.skipped += 1;
                continue;
            }
        };

        if speed > 0 && event.offset_ms > last_offset {
            let gap = event.offset_ms - last_offset;
            let scaled = gap.saturating_mul(100) / speed as u64;
            if scaled > 0 {
                tokio::time::sleep(Duration::from_millis(scaled)).await;
            }
        }
        last_offset = event.offset_ms;

        dispatch.nfqueue_event(event.ctid, &event.data, event.pmark).await;
        stats.events += 1;
    }

    info!("playback finished: {} events, {} skipped", stats.events, stats.skipped);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::tests::make_tcp_packet;
    use crate::dict::InMemoryDictionary;
    use crate::dispatch::DispatchSettings;
    use crate::reports::MemorySink;

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(WarehouseMode::from_flag('C'), Some(WarehouseMode::Capture));
        assert_eq!(WarehouseMode::from_flag('P'), Some(WarehouseMode::Playback));
        assert_eq!(WarehouseMode::from_flag('L'), Some(WarehouseMode::Live));
        assert_eq!(WarehouseMode::from_flag('x'), None);
    }

    #[tokio::test]
    async fn test_capture_playback_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.jsonl");

        let writer = WarehouseWriter::create(&path).unwrap();
        let packet = make_tcp_packet([10, 0, 0, 1], [1, 2, 3, 4], 5000, 80, b"hi");
        writer.record(100, 0, &packet);
        writer.record(100, 0, &packet);
        writer.flush();

        let dispatch = crate::dispatch::Dispatch::startup(
            DispatchSettings::default(),
            InMemoryDictionary::new(),
            MemorySink::new(),
        );
        let stats = playback(&path, 0, &dispatch).await.unwrap();

        assert_eq!(stats.events, 2);
        assert_eq!(stats.skipped, 0);
        assert_eq!(dispatch.session_count(), 1);
        assert_eq!(dispatch.find_session(100).unwrap().packet_count(), 2);
        dispatch.shutdown().await;
    }

    #[tokio::test]
    async fn test_playback_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.jsonl");
        std::fs::write(&path, "not json\n").unwrap();

        let dispatch = crate::dispatch::Dispatch::startup(
            DispatchSettings::default(),
            InMemoryDictionary::new(),
            MemorySink::new(),
        );
        let stats = playback(&path, 0, &dispatch).await.unwrap();
        assert_eq!(stats.events, 0);
        assert_eq!(stats.skipped, 1);
        dispatch.shutdown().await;
    }
}
