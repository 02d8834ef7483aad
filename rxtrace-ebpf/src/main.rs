#![no_std]
#![no_main]

//! Receive-path probes.
//!
//! | program         | type   | attach point    | frame starts at |
//! |-----------------|--------|-----------------|-----------------|
//! | `nic_rx`        | XDP    | interface       | Ethernet        |
//! | `ip_rcv`        | kprobe | `ip_rcv`        | IPv4            |
//! | `ip_rcv_finish` | kprobe | `ip_rcv_finish` | IPv4            |
//! | `tcp_v4_rcv`    | kprobe | `tcp_v4_rcv`    | IPv4            |
//! | `udp_rcv`       | kprobe | `udp_rcv`       | IPv4            |
//!
//! Every program runs the shared pipeline from `rxtrace-common` and lets the
//! packet continue regardless of the outcome.

mod frame;
mod ring;

use aya_ebpf::{
    bindings::xdp_action::XDP_PASS,
    helpers::{bpf_get_smp_processor_id, bpf_ktime_get_ns},
    macros::{kprobe, map, xdp},
    maps::{Array, PerCpuArray, RingBuf},
    programs::{ProbeContext, XdpContext},
};
use core::ptr;
use frame::{SkbFrame, XdpFrame};
use ring::KernelRing;
use rxtrace_common::{
    observe, EmitStats, Emission, Environment, Frame, FrameMeta, HookPoint, SkbLayout,
    RING_BUF_BYTES, STATS_ENTRIES,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 13] = *b"Dual MIT/GPL\0";

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_BYTES, 0);

#[map]
static STATS: PerCpuArray<EmitStats> = PerCpuArray::with_max_entries(STATS_ENTRIES, 0);

#[map]
static SKB_LAYOUT: Array<SkbLayout> = Array::with_max_entries(1, 0);

struct KernelEnv;

impl Environment for KernelEnv {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn cpu_id(&self) -> u32 {
        unsafe { bpf_get_smp_processor_id() }
    }
}

#[xdp]
pub fn nic_rx(ctx: XdpContext) -> u32 {
    let frame = XdpFrame::new(&ctx);
    let queue_id = unsafe { (*ctx.ctx).rx_queue_index } as u16;
    let meta = FrameMeta {
        length: frame.len() as u32,
        queue_id,
    };
    record(HookPoint::NicRx, &frame, meta);
    XDP_PASS
}

/// `int ip_rcv(struct sk_buff *skb, struct net_device *dev, ...)`
#[kprobe]
pub fn ip_rcv(ctx: ProbeContext) -> u32 {
    on_skb(&ctx, HookPoint::IpRcv, 0)
}

/// `int ip_rcv_finish(struct net *net, struct sock *sk, struct sk_buff *skb)`
#[kprobe]
pub fn ip_rcv_finish(ctx: ProbeContext) -> u32 {
    on_skb(&ctx, HookPoint::IpRcvFinish, 2)
}

/// `int tcp_v4_rcv(struct sk_buff *skb)`
#[kprobe]
pub fn tcp_v4_rcv(ctx: ProbeContext) -> u32 {
    on_skb(&ctx, HookPoint::TcpV4Rcv, 0)
}

/// `int udp_rcv(struct sk_buff *skb)`
#[kprobe]
pub fn udp_rcv(ctx: ProbeContext) -> u32 {
    on_skb(&ctx, HookPoint::UdpRcv, 0)
}

#[inline(always)]
fn on_skb(ctx: &ProbeContext, hook: HookPoint, skb_arg: usize) -> u32 {
    let skb: *const u8 = ctx.arg(skb_arg).unwrap_or(ptr::null());
    let frame = SkbFrame::new(skb, SKB_LAYOUT.get(0));
    let meta = FrameMeta {
        length: frame.skb_len(),
        queue_id: frame.rx_queue(),
    };
    record(hook, &frame, meta);
    0
}

#[inline(always)]
fn record<F: Frame>(hook: HookPoint, frame: &F, meta: FrameMeta) {
    let outcome = observe(hook, frame, meta, &KernelEnv, &KernelRing(&EVENTS));
    if let Some(stats) = STATS.get_ptr_mut(hook.tag() as u32) {
        // Per-CPU slot: no other writer can touch it concurrently.
        unsafe {
            match outcome {
                Emission::Published => (*stats).published += 1,
                Emission::Dropped => (*stats).dropped += 1,
            }
        }
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
