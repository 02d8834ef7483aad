//! Host implementation of the emission channel.
//!
//! A bounded multi-producer / single-consumer ring with one sequence number
//! per slot. Producers claim a position with a compare-and-swap on `tail` and
//! fail immediately when the slot ahead has not been consumed yet; the
//! consumer walks positions in order and only reads a slot once its sequence
//! says it was committed. Full means drop-new: nothing already queued is ever
//! overwritten.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use rxtrace_common::{EventChannel, PacketEvent, Reservation};

struct Slot {
    /// `pos` when free for the producer at `pos`, `pos + 1` once committed.
    seq: AtomicUsize,
    /// `None` marks a reservation that was abandoned without publishing.
    value: UnsafeCell<Option<PacketEvent>>,
}

pub struct EventRing {
    slots: Box<[Slot]>,
    tail: AtomicUsize,
    dropped: AtomicU64,
    notify: Notify,
}

// SAFETY: a slot's value is written only by the producer that won the CAS for
// its position, and read only by the consumer after observing the committed
// sequence with Acquire. The two never overlap.
unsafe impl Sync for EventRing {}

impl EventRing {
    /// Splits a new ring holding `capacity` records into its producer and
    /// consumer halves. A single slot cannot tell "committed" from "free for
    /// the next lap", so the ring always has at least two.
    pub fn with_capacity(capacity: usize) -> (RingProducer, RingConsumer) {
        let capacity = capacity.max(2);
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(None),
            })
            .collect();
        let ring = Arc::new(EventRing {
            slots,
            tail: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        (
            RingProducer { ring: ring.clone() },
            RingConsumer { ring, head: 0 },
        )
    }

    /// Sized like the kernel ring buffer: `bytes / size_of::<PacketEvent>()` records.
    pub fn with_byte_size(bytes: usize) -> (RingProducer, RingConsumer) {
        Self::with_capacity(bytes / PacketEvent::SIZE)
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, pos: usize) -> &Slot {
        &self.slots[pos % self.capacity()]
    }

    fn try_reserve(&self) -> Option<RingSlot<'_>> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let seq = self.slot(pos).seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;
            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        return Some(RingSlot {
                            ring: self,
                            pos,
                            committed: false,
                        })
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // The consumer has not freed this slot since the last lap.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }
}

/// Cloneable producer half. Every clone reserves against the same ring.
#[derive(Clone)]
pub struct RingProducer {
    ring: Arc<EventRing>,
}

impl RingProducer {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl EventChannel for RingProducer {
    type Reservation<'a> = RingSlot<'a>;

    fn reserve(&self) -> Option<RingSlot<'_>> {
        self.ring.try_reserve()
    }
}

/// An exclusively owned slot. Dropping it unpublished commits an empty slot
/// the consumer skips, so later positions are never blocked behind it.
pub struct RingSlot<'a> {
    ring: &'a EventRing,
    pos: usize,
    committed: bool,
}

impl RingSlot<'_> {
    fn commit(&mut self, value: Option<PacketEvent>) {
        let slot = self.ring.slot(self.pos);
        // SAFETY: this reservation owns the slot until the Release store below.
        unsafe { *slot.value.get() = value };
        slot.seq.store(self.pos.wrapping_add(1), Ordering::Release);
        self.committed = true;
        self.ring.notify.notify_one();
    }
}

impl Reservation for RingSlot<'_> {
    fn publish(mut self, event: &PacketEvent) {
        self.commit(Some(*event));
    }
}

impl Drop for RingSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.commit(None);
        }
    }
}

/// The single consumer. Not `Clone`: the read position is owned here.
pub struct RingConsumer {
    ring: Arc<EventRing>,
    head: usize,
}

impl RingConsumer {
    /// Next committed record in reservation order, or `None` if the slot at
    /// the head has not been committed yet.
    pub fn try_recv(&mut self) -> Option<PacketEvent> {
        loop {
            let slot = self.ring.slot(self.head);
            let seq = slot.seq.load(Ordering::Acquire);
            if seq != self.head.wrapping_add(1) {
                return None;
            }
            // SAFETY: the committing producer is done with this slot.
            let value = unsafe { (*slot.value.get()).take() };
            slot.seq
                .store(self.head.wrapping_add(self.ring.capacity()), Ordering::Release);
            self.head = self.head.wrapping_add(1);
            if value.is_some() {
                return value;
            }
        }
    }

    /// Waits until a record is available.
    pub async fn recv(&mut self) -> PacketEvent {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.ring.notify.notified().await;
        }
    }

    /// Everything committed so far, in order.
    pub fn drain(&mut self) -> impl Iterator<Item = PacketEvent> + '_ {
        std::iter::from_fn(move || self.try_recv())
    }

    /// Reservations refused because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rxtrace_common::{HookPoint, RING_BUF_BYTES};
    use std::collections::HashMap;
    use std::time::Duration;

    fn event(src_port: u16, seq: u32) -> PacketEvent {
        PacketEvent {
            src_port,
            length: seq,
            hook_point: HookPoint::IpRcv.tag(),
            ..Default::default()
        }
    }

    #[test]
    fn test_capacity_from_bytes() {
        let (producer, consumer) = EventRing::with_byte_size(RING_BUF_BYTES as usize);
        assert_eq!(producer.capacity(), 6553);
        assert_eq!(consumer.capacity(), 6553);

        let (producer, _) = EventRing::with_byte_size(10);
        assert_eq!(producer.capacity(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let (producer, mut consumer) = EventRing::with_capacity(4);
        for i in 0..3 {
            producer.reserve().unwrap().publish(&event(1, i));
        }
        let got: Vec<u32> = consumer.drain().map(|e| e.length).collect();
        assert_eq!(got, vec![0, 1, 2]);
        assert!(consumer.try_recv().is_none());
    }

    #[test]
    fn test_full_drops_new_and_keeps_old() {
        let (producer, mut consumer) = EventRing::with_capacity(2);
        producer.reserve().unwrap().publish(&event(1, 10));
        producer.reserve().unwrap().publish(&event(1, 11));
        assert!(producer.reserve().is_none());
        assert!(producer.reserve().is_none());
        assert_eq!(consumer.dropped(), 2);

        let got: Vec<u32> = consumer.drain().map(|e| e.length).collect();
        assert_eq!(got, vec![10, 11]);

        // Freed slots are usable again after the wrap.
        producer.reserve().unwrap().publish(&event(1, 12));
        assert_eq!(consumer.try_recv().map(|e| e.length), Some(12));
    }

    #[test]
    fn test_uncommitted_slot_is_not_visible() {
        let (producer, mut consumer) = EventRing::with_capacity(4);
        let first = producer.reserve().unwrap();
        producer.reserve().unwrap().publish(&event(1, 2));

        // The second record waits behind the still-open first reservation.
        assert!(consumer.try_recv().is_none());
        first.publish(&event(1, 1));
        let got: Vec<u32> = consumer.drain().map(|e| e.length).collect();
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn test_abandoned_reservation_is_skipped() {
        let (producer, mut consumer) = EventRing::with_capacity(4);
        drop(producer.reserve().unwrap());
        producer.reserve().unwrap().publish(&event(1, 7));

        assert_eq!(consumer.try_recv().map(|e| e.length), Some(7));
        assert!(consumer.try_recv().is_none());
        assert_eq!(consumer.dropped(), 0);
    }

    #[test]
    fn test_concurrent_producers_beyond_capacity() {
        const PRODUCERS: u16 = 4;
        const PER_PRODUCER: u32 = 20_000;

        let (producer, mut consumer) = EventRing::with_capacity(64);
        let mut delivered: Vec<PacketEvent> = Vec::new();

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..PRODUCERS)
                .map(|id| {
                    let producer = producer.clone();
                    scope.spawn(move || {
                        for seq in 0..PER_PRODUCER {
                            if let Some(slot) = producer.reserve() {
                                slot.publish(&event(id, seq));
                            }
                        }
                    })
                })
                .collect();

            while handles.iter().any(|h| !h.is_finished()) {
                delivered.extend(consumer.drain());
            }
        });
        delivered.extend(consumer.drain());

        let attempted = PRODUCERS as u64 * PER_PRODUCER as u64;
        assert_eq!(delivered.len() as u64 + consumer.dropped(), attempted);

        // Every record is intact and each producer's records stay in order.
        let mut last: HashMap<u16, u32> = HashMap::new();
        for e in &delivered {
            assert!(e.src_port < PRODUCERS);
            assert_eq!(e.hook(), Ok(HookPoint::IpRcv));
            if let Some(prev) = last.insert(e.src_port, e.length) {
                assert!(e.length > prev);
            }
        }
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let (producer, mut consumer) = EventRing::with_capacity(8);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.reserve().unwrap().publish(&event(3, 99));
        });

        let got = tokio::time::timeout(Duration::from_secs(5), consumer.recv())
            .await
            .expect("recv timed out");
        assert_eq!(got.length, 99);
        task.await.unwrap();
    }
}
