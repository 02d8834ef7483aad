//! Host-side replay: Ethernet frames from a capture are pushed through the
//! same in-path pipeline the kernel hooks run, emitting into an
//! [`EventRing`](crate::ring::EventRing).
//!
//! Each frame visits the enabled hooks in receive order. The network-layer
//! hooks only see what the stack would hand them: IPv4 frames for
//! `IP_RCV`/`IP_RCV_FINISH`, and TCP or UDP segments for the two transport
//! receive functions.

use std::time::Instant;

use rxtrace_common::{
    extract, observe, Emission, EventChannel, Environment, FrameMeta, HookPoint, Layer, SliceFrame,
    IPPROTO_TCP, IPPROTO_UDP,
};

#[cfg(feature = "replay")]
pub use capture::replay_file;

const ETH_HLEN: usize = 14;
const ETH_P_IP: [u8; 2] = [0x08, 0x00];

/// Host clock and a fixed CPU number for one replay worker.
pub struct HostEnv {
    start: Instant,
    cpu: u32,
}

impl HostEnv {
    pub fn new(cpu: u32) -> Self {
        Self {
            start: Instant::now(),
            cpu,
        }
    }
}

impl Environment for HostEnv {
    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn cpu_id(&self) -> u32 {
        self.cpu
    }
}

/// Outcome counts for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    pub published: u32,
    pub dropped: u32,
}

/// Runs one captured Ethernet frame through every enabled hook it would reach.
/// `wire_len` is the on-wire frame length, which may exceed `bytes` for
/// truncated captures.
pub fn replay_frame<C: EventChannel>(
    bytes: &[u8],
    wire_len: u32,
    hooks: &[HookPoint],
    env: &HostEnv,
    channel: &C,
) -> FrameOutcome {
    let mut outcome = FrameOutcome::default();
    let is_ipv4 = bytes.get(12..ETH_HLEN) == Some(&ETH_P_IP[..]);
    let network = bytes.get(ETH_HLEN..).unwrap_or_default();
    let protocol = if is_ipv4 {
        extract(Layer::Network, &SliceFrame::new(network)).protocol
    } else {
        0
    };

    for hook in HookPoint::ALL {
        if !hooks.contains(&hook) {
            continue;
        }
        let reached = match hook {
            HookPoint::NicRx => true,
            HookPoint::IpRcv | HookPoint::IpRcvFinish => is_ipv4,
            HookPoint::TcpV4Rcv => is_ipv4 && protocol == IPPROTO_TCP,
            HookPoint::UdpRcv => is_ipv4 && protocol == IPPROTO_UDP,
        };
        if !reached {
            continue;
        }
        let (frame, length) = match hook.entry_layer() {
            Layer::Link => (bytes, wire_len),
            Layer::Network => (network, wire_len.saturating_sub(ETH_HLEN as u32)),
        };
        let meta = FrameMeta {
            length,
            queue_id: 0,
        };
        match observe(hook, &SliceFrame::new(frame), meta, env, channel) {
            Emission::Published => outcome.published += 1,
            Emission::Dropped => outcome.dropped += 1,
        }
    }
    outcome
}

#[cfg(feature = "replay")]
mod capture {
    use std::io::{self, BufWriter, Write};
    use std::path::Path;

    use anyhow::Context as _;
    use tracing::info;

    use super::{replay_frame, HostEnv};
    use crate::decode::{write_event, OutputFormat};
    use crate::ring::EventRing;
    use crate::stats::{StatsSnapshot, StreamStats};
    use rxtrace_common::HookPoint;

    /// Replays every frame of `path`. A blocking worker produces while this
    /// task consumes, so a small ring can overflow just as the kernel one does.
    pub async fn replay_file(
        path: &Path,
        hooks: Vec<HookPoint>,
        ring_bytes: usize,
        format: OutputFormat,
    ) -> anyhow::Result<StatsSnapshot> {
        let mut capture = pcap::Capture::from_file(path)
            .with_context(|| format!("failed to open capture {}", path.display()))?;
        let (producer, mut consumer) = EventRing::with_byte_size(ring_bytes);
        info!(
            "replaying {} through {} hook(s), ring of {} records",
            path.display(),
            hooks.len(),
            consumer.capacity()
        );

        let worker = tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let env = HostEnv::new(0);
            let mut frames = 0u64;
            loop {
                match capture.next_packet() {
                    Ok(packet) => {
                        replay_frame(packet.data, packet.header.len, &hooks, &env, &producer);
                        frames += 1;
                    }
                    Err(pcap::Error::NoMorePackets) => return Ok(frames),
                    Err(e) => return Err(e).context("failed to read capture"),
                }
            }
        });
        tokio::pin!(worker);

        let stats = StreamStats::new();
        let stdout = io::stdout();
        let frames = loop {
            tokio::select! {
                event = consumer.recv() => {
                    stats.update(&event);
                    write_event(&mut stdout.lock(), &event, format)?;
                }
                result = &mut worker => break result??,
            }
        };

        let mut out = BufWriter::new(stdout.lock());
        for event in consumer.drain() {
            stats.update(&event);
            write_event(&mut out, &event, format)?;
        }
        out.flush()?;

        let snapshot = stats.snapshot();
        info!(
            frames,
            records = snapshot.total_records,
            dropped = consumer.dropped(),
            "replay finished"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::EventRing;
    use etherparse::PacketBuilder;
    use rxtrace_common::flow_hash;

    fn udp_frame() -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4([172, 16, 0, 1], [8, 8, 8, 8], 64)
            .udp(53000, 53);
        let mut out = Vec::new();
        builder.write(&mut out, &[0u8; 12]).unwrap();
        out
    }

    fn tcp_frame() -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(12345, 80, 0, 64240)
            .syn();
        let mut out = Vec::new();
        builder.write(&mut out, &[]).unwrap();
        out
    }

    #[test]
    fn test_udp_frame_visits_udp_path() {
        let bytes = udp_frame();
        let (producer, mut consumer) = EventRing::with_capacity(16);
        let outcome = replay_frame(
            &bytes,
            bytes.len() as u32,
            &HookPoint::ALL,
            &HostEnv::new(1),
            &producer,
        );
        assert_eq!(outcome, FrameOutcome { published: 4, dropped: 0 });

        let events: Vec<_> = consumer.drain().collect();
        let hooks: Vec<HookPoint> = events.iter().map(|e| e.hook().unwrap()).collect();
        assert_eq!(
            hooks,
            vec![
                HookPoint::NicRx,
                HookPoint::IpRcv,
                HookPoint::IpRcvFinish,
                HookPoint::UdpRcv
            ]
        );

        let key = flow_hash(
            u32::from_ne_bytes([172, 16, 0, 1]),
            u32::from_ne_bytes([8, 8, 8, 8]),
            IPPROTO_UDP,
        );
        assert!(events.iter().all(|e| e.correlation_key == key));
        assert!(events.iter().all(|e| e.dst_port() == 53 && e.cpu_id == 1));
        assert_eq!(events[0].length, bytes.len() as u32);
        assert_eq!(events[1].length, bytes.len() as u32 - 14);
    }

    #[test]
    fn test_hook_selection() {
        let bytes = tcp_frame();
        let (producer, mut consumer) = EventRing::with_capacity(16);
        replay_frame(
            &bytes,
            bytes.len() as u32,
            &[HookPoint::TcpV4Rcv, HookPoint::UdpRcv],
            &HostEnv::new(0),
            &producer,
        );
        let events: Vec<_> = consumer.drain().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].hook(), Ok(HookPoint::TcpV4Rcv));
        assert_eq!(events[0].src_port(), 12345);
    }

    #[test]
    fn test_non_ip_frame_only_reaches_nic_rx() {
        let mut bytes = vec![0u8; 60];
        bytes[12..14].copy_from_slice(&[0x08, 0x06]);
        let (producer, mut consumer) = EventRing::with_capacity(16);
        let outcome = replay_frame(&bytes, 60, &HookPoint::ALL, &HostEnv::new(0), &producer);
        assert_eq!(outcome.published, 1);
        let event = consumer.try_recv().unwrap();
        assert_eq!(event.hook(), Ok(HookPoint::NicRx));
        assert_eq!((event.src_addr, event.protocol), (0, 0));
    }

    #[test]
    fn test_small_ring_drops_and_counts() {
        let bytes = tcp_frame();
        let (producer, consumer) = EventRing::with_capacity(2);
        let outcome = replay_frame(
            &bytes,
            bytes.len() as u32,
            &HookPoint::ALL,
            &HostEnv::new(0),
            &producer,
        );
        assert_eq!(outcome, FrameOutcome { published: 2, dropped: 2 });
        assert_eq!(consumer.dropped(), 2);
    }
}
