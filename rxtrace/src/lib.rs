//! Userspace side of rxtrace: loads the receive-path probes, drains their
//! ring buffer and reports counters. The host [`ring::EventRing`] and the
//! [`replay`] module run the shared in-path pipeline without a kernel.

pub mod config;
pub mod decode;
pub mod drain;
pub mod loader;
pub mod replay;
pub mod ring;
pub mod stats;
