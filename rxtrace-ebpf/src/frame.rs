//! Kernel-side [`Frame`] backends.

use aya_ebpf::{helpers::bpf_probe_read_kernel, programs::XdpContext};
use core::{mem, ptr};
use rxtrace_common::{Frame, Plain, SkbLayout};

/// Direct packet access between `data` and `data_end`.
///
/// The bounds check compares packet pointers right before the read, which is
/// the form the verifier accepts.
pub struct XdpFrame {
    start: usize,
    end: usize,
}

impl XdpFrame {
    #[inline(always)]
    pub fn new(ctx: &XdpContext) -> Self {
        Self {
            start: ctx.data(),
            end: ctx.data_end(),
        }
    }
}

impl Frame for XdpFrame {
    #[inline(always)]
    fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline(always)]
    fn load<T: Plain>(&self, offset: usize) -> Option<T> {
        let at = self.start + offset;
        if at + mem::size_of::<T>() > self.end {
            return None;
        }
        // SAFETY: [at, at + size_of::<T>()) is inside [data, data_end).
        Some(unsafe { ptr::read_unaligned(at as *const T) })
    }
}

/// The linear part of an `sk_buff`, starting at its network header.
///
/// Bytes live in kernel memory and are copied with `bpf_probe_read_kernel`,
/// which fails instead of faulting; the frame still refuses anything past the
/// linear tail.
pub struct SkbFrame {
    base: *const u8,
    linear: usize,
    skb_len: u32,
    queue_mapping: u16,
}

impl SkbFrame {
    const EMPTY: SkbFrame = SkbFrame {
        base: ptr::null(),
        linear: 0,
        skb_len: 0,
        queue_mapping: 0,
    };

    #[inline(always)]
    pub fn new(skb: *const u8, layout: Option<&SkbLayout>) -> Self {
        let Some(layout) = layout else {
            return Self::EMPTY;
        };
        if skb.is_null() || !layout.is_configured() {
            return Self::EMPTY;
        }

        // SAFETY: probe reads never fault, they return Err on bad addresses.
        let (skb_len, queue_mapping, head, tail, network_header) = unsafe {
            (
                read_field::<u32>(skb, layout.len).unwrap_or(0),
                read_field::<u16>(skb, layout.queue_mapping).unwrap_or(0),
                read_field::<u64>(skb, layout.head).unwrap_or(0),
                read_field::<u32>(skb, layout.tail).unwrap_or(0),
                read_field::<u16>(skb, layout.network_header).unwrap_or(u16::MAX),
            )
        };

        let mut frame = SkbFrame {
            skb_len,
            queue_mapping,
            ..Self::EMPTY
        };
        // network_header is ~0 until the stack sets it.
        if head == 0 || network_header == u16::MAX || tail <= network_header as u32 {
            return frame;
        }
        frame.base = (head as usize + network_header as usize) as *const u8;
        frame.linear = (tail - network_header as u32) as usize;
        frame
    }

    pub fn skb_len(&self) -> u32 {
        self.skb_len
    }

    /// Recorded receive queue. The stack stores `queue + 1`, 0 meaning unset.
    pub fn rx_queue(&self) -> u16 {
        self.queue_mapping.saturating_sub(1)
    }
}

impl Frame for SkbFrame {
    #[inline(always)]
    fn len(&self) -> usize {
        self.linear
    }

    #[inline(always)]
    fn load<T: Plain>(&self, offset: usize) -> Option<T> {
        if offset + mem::size_of::<T>() > self.linear {
            return None;
        }
        // SAFETY: within the linear area; the helper copies or fails.
        unsafe { bpf_probe_read_kernel(self.base.add(offset) as *const T).ok() }
    }
}

#[inline(always)]
unsafe fn read_field<T>(skb: *const u8, offset: u32) -> Option<T> {
    bpf_probe_read_kernel(skb.add(offset as usize) as *const T).ok()
}
