//! Two-phase emission: reserve a slot, then publish a complete record into it.

use crate::event::PacketEvent;

/// A bounded, multi-producer, drop-on-full event sink.
///
/// Implemented by the kernel ring buffer in the eBPF object and by the host
/// `EventRing` in the agent.
pub trait EventChannel {
    type Reservation<'a>: Reservation
    where
        Self: 'a;

    /// Claims space for one record. `None` means the channel is full; the
    /// caller drops the record and never retries.
    fn reserve(&self) -> Option<Self::Reservation<'_>>;
}

/// A claimed slot that is not yet visible to the consumer.
pub trait Reservation {
    /// Copies every field of `event` into the slot and makes it visible.
    fn publish(self, event: &PacketEvent);
}
