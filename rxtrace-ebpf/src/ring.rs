use aya_ebpf::maps::{ring_buf::RingBufEntry, RingBuf};
use core::ptr;
use rxtrace_common::{EventChannel, PacketEvent, Reservation};

/// The `EVENTS` ring buffer seen through the shared emission traits.
pub struct KernelRing(pub &'static RingBuf);

pub struct KernelSlot(RingBufEntry<PacketEvent>);

impl EventChannel for KernelRing {
    type Reservation<'a> = KernelSlot;

    #[inline(always)]
    fn reserve(&self) -> Option<KernelSlot> {
        self.0.reserve::<PacketEvent>(0).map(KernelSlot)
    }
}

impl Reservation for KernelSlot {
    /// Field-by-field writes: a whole-struct copy becomes a `memcpy` call in
    /// `.text`, a cross-section relocation aya cannot resolve.
    #[inline(always)]
    fn publish(self, event: &PacketEvent) {
        let mut entry = self.0;
        let p = entry.as_mut_ptr();
        unsafe {
            ptr::write(ptr::addr_of_mut!((*p).timestamp_ns), event.timestamp_ns);
            ptr::write(ptr::addr_of_mut!((*p).correlation_key), event.correlation_key);
            ptr::write(ptr::addr_of_mut!((*p).src_addr), event.src_addr);
            ptr::write(ptr::addr_of_mut!((*p).dst_addr), event.dst_addr);
            ptr::write(ptr::addr_of_mut!((*p).src_port), event.src_port);
            ptr::write(ptr::addr_of_mut!((*p).dst_port), event.dst_port);
            ptr::write(ptr::addr_of_mut!((*p).protocol), event.protocol);
            ptr::write(ptr::addr_of_mut!((*p).hook_point), event.hook_point);
            ptr::write(ptr::addr_of_mut!((*p)._pad1), 0);
            ptr::write(ptr::addr_of_mut!((*p).length), event.length);
            ptr::write(ptr::addr_of_mut!((*p).cpu_id), event.cpu_id);
            ptr::write(ptr::addr_of_mut!((*p).queue_id), event.queue_id);
            ptr::write(ptr::addr_of_mut!((*p)._pad2), 0);
        }
        entry.submit(0);
    }
}
