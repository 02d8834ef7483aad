#![cfg_attr(not(test), no_std)]

//! Shared in-path core for the receive-path probes.
//!
//! Everything in this crate runs inside the eBPF hooks and must therefore stay
//! `no_std`, allocation-free and loop-free: a bounded header cursor, a
//! fixed-depth Ethernet/IPv4/TCP/UDP dispatcher, the flow hasher, the event
//! builder and the two-phase emission traits. The same code is compiled for
//! the host (with the `user` feature) so the agent and the tests exercise the
//! exact pipeline the kernel runs.

pub mod channel;
pub mod cursor;
pub mod dispatch;
pub mod event;
pub mod hash;
pub mod pipeline;

pub use channel::{EventChannel, Reservation};
pub use cursor::{Field, Frame, Header, HeaderCursor, HeaderView, Plain, SliceFrame};
pub use dispatch::{dispatch_link, dispatch_network, FlowTuple};
pub use event::{
    EmitStats, HookPoint, InvalidHookPoint, Layer, PacketEvent, Protocol, SkbLayout,
    UnknownHookName, IPPROTO_TCP, IPPROTO_UDP, RECORD_VERSION, RING_BUF_BYTES, STATS_ENTRIES,
};
pub use hash::flow_hash;
pub use pipeline::{build_event, extract, observe, Emission, Environment, FrameMeta};
