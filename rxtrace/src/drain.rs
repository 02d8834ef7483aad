use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use aya::maps::{MapData, RingBuf};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;

use crate::decode::{decode, write_event, OutputFormat};
use crate::stats::StreamStats;

/// Drains the `EVENTS` ring buffer whenever its fd becomes readable.
/// Runs until an output error occurs; cancel the task to stop it.
pub async fn drain_ring(
    ring: RingBuf<MapData>,
    stats: Arc<StreamStats>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut ring = AsyncFd::with_interest(ring, Interest::READABLE)?;
    loop {
        let mut guard = ring.readable_mut().await?;
        drain_batch(guard.get_inner_mut(), &stats, format)?;
        guard.clear_ready();
    }
}

fn drain_batch(
    ring: &mut RingBuf<MapData>,
    stats: &StreamStats,
    format: OutputFormat,
) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    while let Some(item) = ring.next() {
        consume(&item, stats, &mut out, format)?;
    }
    out.flush()
}

/// Decodes one entry; malformed entries are counted and skipped.
pub fn consume<W: Write>(
    bytes: &[u8],
    stats: &StreamStats,
    out: &mut W,
    format: OutputFormat,
) -> io::Result<()> {
    match decode(bytes) {
        Ok(event) => {
            stats.update(&event);
            write_event(out, &event, format)
        }
        Err(e) => {
            stats.record_malformed();
            debug!("skipping malformed record: {}", e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rxtrace_common::{HookPoint, PacketEvent};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_consume_mixed_entries() {
        let stats = StreamStats::new();
        let mut out = Vec::new();
        let good = PacketEvent {
            hook_point: HookPoint::IpRcv.tag(),
            length: 60,
            ..Default::default()
        };
        let mut bad = good;
        bad.hook_point = 0;

        consume(good.as_bytes(), &stats, &mut out, OutputFormat::Text).unwrap();
        consume(&good.as_bytes()[..12], &stats, &mut out, OutputFormat::Text).unwrap();
        consume(bad.as_bytes(), &stats, &mut out, OutputFormat::Text).unwrap();

        assert_eq!(stats.total_records.load(Ordering::Relaxed), 1);
        assert_eq!(stats.malformed.load(Ordering::Relaxed), 2);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("IP_RCV"));
    }
}
