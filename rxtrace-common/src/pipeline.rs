//! The per-packet path shared by all five hooks:
//! dispatch → hash → build → emit, always fail-open.

use crate::{
    channel::{EventChannel, Reservation},
    cursor::{Frame, HeaderCursor},
    dispatch::{dispatch_link, dispatch_network, FlowTuple},
    event::{HookPoint, Layer, PacketEvent},
};

/// Observation-time facts supplied by the execution context.
pub trait Environment {
    /// Monotonic clock in nanoseconds.
    fn now_ns(&self) -> u64;
    /// Core executing the hook.
    fn cpu_id(&self) -> u32;
}

/// Facts about the frame that come from the hook context, not its bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub length: u32,
    pub queue_id: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Emission {
    Published,
    /// Channel full; the record is gone.
    Dropped,
}

#[inline(always)]
pub fn extract<F: Frame>(layer: Layer, frame: &F) -> FlowTuple {
    let cursor = HeaderCursor::new(frame);
    match layer {
        Layer::Link => dispatch_link(&cursor),
        Layer::Network => dispatch_network(&cursor, 0),
    }
}

/// Fills every field of the record. Timestamp and CPU are read here, before
/// any slot is reserved.
#[inline(always)]
pub fn build_event<E: Environment>(
    hook: HookPoint,
    tuple: &FlowTuple,
    meta: FrameMeta,
    env: &E,
) -> PacketEvent {
    PacketEvent {
        timestamp_ns: env.now_ns(),
        correlation_key: tuple.correlation_key(),
        src_addr: tuple.src_addr,
        dst_addr: tuple.dst_addr,
        src_port: tuple.src_port,
        dst_port: tuple.dst_port,
        protocol: tuple.protocol,
        hook_point: hook.tag(),
        _pad1: 0,
        length: meta.length,
        cpu_id: env.cpu_id(),
        queue_id: meta.queue_id,
        _pad2: 0,
    }
}

/// Runs one hook invocation end to end. The caller lets the packet continue
/// whatever this returns.
#[inline(always)]
pub fn observe<F, E, C>(
    hook: HookPoint,
    frame: &F,
    meta: FrameMeta,
    env: &E,
    channel: &C,
) -> Emission
where
    F: Frame,
    E: Environment,
    C: EventChannel,
{
    let tuple = extract(hook.entry_layer(), frame);
    let event = build_event(hook, &tuple, meta, env);
    match channel.reserve() {
        Some(slot) => {
            slot.publish(&event);
            Emission::Published
        }
        None => Emission::Dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cursor::SliceFrame, event::IPPROTO_TCP, hash::flow_hash};
    use core::cell::{Cell, RefCell};
    use etherparse::PacketBuilder;

    struct FixedEnv {
        clock: Cell<u64>,
        cpu: u32,
    }

    impl Environment for FixedEnv {
        fn now_ns(&self) -> u64 {
            let now = self.clock.get();
            self.clock.set(now + 1);
            now
        }

        fn cpu_id(&self) -> u32 {
            self.cpu
        }
    }

    struct VecChannel {
        capacity: usize,
        events: RefCell<Vec<PacketEvent>>,
    }

    struct VecSlot<'a>(&'a VecChannel);

    impl EventChannel for VecChannel {
        type Reservation<'a> = VecSlot<'a>;

        fn reserve(&self) -> Option<VecSlot<'_>> {
            (self.events.borrow().len() < self.capacity).then_some(VecSlot(self))
        }
    }

    impl Reservation for VecSlot<'_> {
        fn publish(self, event: &PacketEvent) {
            self.0.events.borrow_mut().push(*event);
        }
    }

    fn channel(capacity: usize) -> VecChannel {
        VecChannel {
            capacity,
            events: RefCell::new(Vec::new()),
        }
    }

    fn env(cpu: u32) -> FixedEnv {
        FixedEnv {
            clock: Cell::new(1_000),
            cpu,
        }
    }

    fn syn_frame() -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(12345, 80, 0, 64240)
            .syn();
        let mut out = Vec::new();
        builder.write(&mut out, &[]).unwrap();
        out
    }

    fn meta(bytes: &[u8]) -> FrameMeta {
        FrameMeta {
            length: bytes.len() as u32,
            queue_id: 0,
        }
    }

    #[test]
    fn test_syn_at_nic_rx() {
        let bytes = syn_frame();
        let sink = channel(8);
        let outcome = observe(
            HookPoint::NicRx,
            &SliceFrame::new(&bytes),
            meta(&bytes),
            &env(2),
            &sink,
        );
        assert_eq!(outcome, Emission::Published);

        let events = sink.events.borrow();
        let event = events[0];
        let src = u32::from_ne_bytes([10, 0, 0, 1]);
        let dst = u32::from_ne_bytes([10, 0, 0, 2]);
        assert_eq!(event.protocol, IPPROTO_TCP);
        assert_eq!(event.hook(), Ok(HookPoint::NicRx));
        assert_eq!(event.src_addr, src);
        assert_eq!(event.dst_addr, dst);
        assert_eq!(event.src_port(), 12345);
        assert_eq!(event.dst_port(), 80);
        assert_eq!(event.correlation_key, src ^ dst ^ 6);
        assert_eq!(event.length, 54);
        assert_eq!(event.cpu_id, 2);
        assert_eq!(event.timestamp_ns, 1_000);
    }

    #[test]
    fn test_key_is_independent_of_hook() {
        let bytes = syn_frame();
        let sink = channel(8);
        let env = env(0);

        observe(HookPoint::NicRx, &SliceFrame::new(&bytes), meta(&bytes), &env, &sink);
        let ip = &bytes[14..];
        for hook in [HookPoint::IpRcv, HookPoint::IpRcvFinish, HookPoint::TcpV4Rcv] {
            observe(hook, &SliceFrame::new(ip), meta(ip), &env, &sink);
        }

        let events = sink.events.borrow();
        assert_eq!(events.len(), 4);
        let key = events[0].correlation_key;
        assert!(events.iter().all(|e| e.correlation_key == key));
        assert!(events.iter().all(|e| e.src_port() == 12345));
        let hooks: Vec<u8> = events.iter().map(|e| e.hook_point).collect();
        assert_eq!(hooks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rerun_is_identical_except_time_and_cpu() {
        let bytes = syn_frame();
        let sink = channel(8);

        observe(HookPoint::NicRx, &SliceFrame::new(&bytes), meta(&bytes), &env(0), &sink);
        observe(HookPoint::NicRx, &SliceFrame::new(&bytes), meta(&bytes), &env(5), &sink);

        let events = sink.events.borrow();
        let (mut a, mut b) = (events[0], events[1]);
        assert_ne!(a.cpu_id, b.cpu_id);
        a.timestamp_ns = 0;
        b.timestamp_ns = 0;
        a.cpu_id = 0;
        b.cpu_id = 0;
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_garbage_still_emits_zero_filled_record() {
        let bytes = [0xaau8; 9];
        let sink = channel(1);
        let outcome = observe(
            HookPoint::UdpRcv,
            &SliceFrame::new(&bytes),
            FrameMeta { length: 9, queue_id: 3 },
            &env(1),
            &sink,
        );
        assert_eq!(outcome, Emission::Published);

        let event = sink.events.borrow()[0];
        assert_eq!((event.src_addr, event.dst_addr, event.protocol), (0, 0, 0));
        assert_eq!((event.src_port, event.dst_port), (0, 0));
        assert_eq!(event.correlation_key, flow_hash(0, 0, 0));
        assert_eq!(event.hook(), Ok(HookPoint::UdpRcv));
        assert_eq!(event.length, 9);
        assert_eq!(event.queue_id, 3);
        assert_eq!((event._pad1, event._pad2), (0, 0));
    }

    #[test]
    fn test_full_channel_drops_silently() {
        let bytes = syn_frame();
        let sink = channel(1);
        let env = env(0);
        let frame = SliceFrame::new(&bytes);

        assert_eq!(
            observe(HookPoint::NicRx, &frame, meta(&bytes), &env, &sink),
            Emission::Published
        );
        assert_eq!(
            observe(HookPoint::NicRx, &frame, meta(&bytes), &env, &sink),
            Emission::Dropped
        );
        assert_eq!(sink.events.borrow().len(), 1);
    }
}
