//! SPSC descriptor ring over raw shared memory.
//!
//! The ring header and entries live inside a [`SharedRegion`] so both ends
//! of a fifo (possibly in different processes) see the same state. `head` is
//! published by the producer with release ordering and read by the consumer
//! with acquire; `tail` the other way around. Exactly one producer and one
//! consumer per ring — the fifo endpoints enforce the roles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ethmux_core::{FrameDesc, FRAME_DESC_SIZE, RING_CAPACITY};

use crate::region::SharedRegion;
use crate::ShmError;

/// Bytes reserved for the ring header (head, tail, capacity + padding).
pub const RING_HEADER_SIZE: usize = 64;

/// Total bytes a ring occupies: header plus entries. Fits one 4 KiB page.
pub const RING_BYTES: usize = RING_HEADER_SIZE + RING_CAPACITY as usize * FRAME_DESC_SIZE;

const _: () = assert!(RING_BYTES <= 4096);
const _: () = assert!(RING_CAPACITY.is_power_of_two());

#[repr(C)]
struct RingHeader {
    /// Next slot the producer will write; published after the entry is.
    head: AtomicU64,
    /// Next slot the consumer will read.
    tail: AtomicU64,
    /// Capacity echo, so a peer can sanity-check the layout it mapped.
    capacity: u32,
    _pad: u32,
}

const _: () = assert!(std::mem::size_of::<RingHeader>() <= RING_HEADER_SIZE);

/// Errors from ring operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    Full,
}

/// A view of one ring inside a shared region.
///
/// Cloning the `Arc<SharedRegion>` into the view keeps the mapping alive for
/// as long as any view exists.
pub struct DescRing {
    _region: Arc<SharedRegion>,
    hdr: *const RingHeader,
    entries: *mut FrameDesc,
}

// SAFETY: the raw pointers target a mapping owned by `_region`, which lives
// as long as the view; all shared-state access goes through atomics.
unsafe impl Send for DescRing {}
unsafe impl Sync for DescRing {}

impl DescRing {
    /// Initialize a fresh ring at `offset` within the region and attach.
    pub fn init_at(region: &Arc<SharedRegion>, offset: usize) -> Result<Self, ShmError> {
        let ring = Self::attach(region, offset)?;
        let hdr = ring.hdr();
        hdr.head.store(0, Ordering::Relaxed);
        hdr.tail.store(0, Ordering::Relaxed);
        // Plain store is fine pre-publication; the region is not shared yet.
        // SAFETY: hdr points into the checked range.
        unsafe {
            std::ptr::addr_of!((*ring.hdr).capacity)
                .cast_mut()
                .write(RING_CAPACITY);
        }
        Ok(ring)
    }

    /// Attach to a ring previously initialized at `offset`.
    pub fn attach(region: &Arc<SharedRegion>, offset: usize) -> Result<Self, ShmError> {
        let end = offset.checked_add(RING_BYTES);
        if offset % 8 != 0 || end.map_or(true, |end| end > region.len()) {
            return Err(ShmError::OutOfBounds {
                offset: offset as u32,
                length: RING_BYTES as u32,
                size: region.len(),
            });
        }
        // SAFETY: the range [offset, offset + RING_BYTES) is inside the
        // mapping and 8-aligned; header and entries are repr(C) PODs.
        let base = unsafe { region.base().add(offset) };
        Ok(Self {
            _region: Arc::clone(region),
            hdr: base.cast(),
            entries: unsafe { base.add(RING_HEADER_SIZE) }.cast(),
        })
    }

    fn hdr(&self) -> &RingHeader {
        // SAFETY: hdr stays valid while `_region` is held.
        unsafe { &*self.hdr }
    }

    #[inline]
    fn mask(&self) -> u64 {
        u64::from(RING_CAPACITY) - 1
    }

    pub fn capacity(&self) -> u32 {
        RING_CAPACITY
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        let hdr = self.hdr();
        let head = hdr.head.load(Ordering::Acquire);
        let tail = hdr.tail.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side: append one entry.
    pub fn try_push(&self, desc: &FrameDesc) -> Result<(), RingError> {
        let hdr = self.hdr();
        let head = hdr.head.load(Ordering::Relaxed);
        let tail = hdr.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= u64::from(RING_CAPACITY) {
            return Err(RingError::Full);
        }
        let idx = (head & self.mask()) as usize;
        // SAFETY: idx < RING_CAPACITY; the slot is unreachable by the
        // consumer until head is published below.
        unsafe {
            self.entries.add(idx).write(*desc);
        }
        hdr.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side: take one entry.
    pub fn pop(&self) -> Option<FrameDesc> {
        let hdr = self.hdr();
        let tail = hdr.tail.load(Ordering::Relaxed);
        let head = hdr.head.load(Ordering::Acquire);
        if tail >= head {
            return None;
        }
        let idx = (tail & self.mask()) as usize;
        // SAFETY: idx < RING_CAPACITY; the entry was published by the
        // matching release store of head.
        let desc = unsafe { self.entries.add(idx).read() };
        hdr.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(desc)
    }

    /// Consumer side: take up to `out.len()` entries, returning the count.
    pub fn pop_batch(&self, out: &mut [FrameDesc]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.pop() {
                Some(desc) => {
                    out[n] = desc;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> DescRing {
        let region = Arc::new(SharedRegion::create(4096).unwrap());
        DescRing::init_at(&region, 0).unwrap()
    }

    #[test]
    fn fifo_order() {
        let r = ring();
        for i in 0..10u64 {
            r.try_push(&FrameDesc::new(0, 0, i)).unwrap();
        }
        for i in 0..10u64 {
            assert_eq!(r.pop().unwrap().cookie, i);
        }
        assert!(r.pop().is_none());
    }

    #[test]
    fn full_at_capacity() {
        let r = ring();
        for i in 0..RING_CAPACITY as u64 {
            r.try_push(&FrameDesc::new(0, 0, i)).unwrap();
        }
        assert_eq!(
            r.try_push(&FrameDesc::new(0, 0, 999)),
            Err(RingError::Full)
        );
        assert_eq!(r.pop().unwrap().cookie, 0);
        r.try_push(&FrameDesc::new(0, 0, 999)).unwrap();
    }

    #[test]
    fn wrap_around() {
        let r = ring();
        for round in 0..5u64 {
            for i in 0..RING_CAPACITY as u64 {
                r.try_push(&FrameDesc::new(0, 0, round * 1000 + i)).unwrap();
            }
            for i in 0..RING_CAPACITY as u64 {
                assert_eq!(r.pop().unwrap().cookie, round * 1000 + i);
            }
        }
    }

    #[test]
    fn pop_batch_drains() {
        let r = ring();
        for i in 0..5u64 {
            r.try_push(&FrameDesc::new(0, 0, i)).unwrap();
        }
        let mut out = [FrameDesc::zeroed(); 8];
        assert_eq!(r.pop_batch(&mut out), 5);
        assert_eq!(out[4].cookie, 4);
        assert_eq!(r.pop_batch(&mut out), 0);
    }

    #[test]
    fn attach_rejects_out_of_bounds() {
        let region = Arc::new(SharedRegion::create(4096).unwrap());
        assert!(DescRing::attach(&region, 4096).is_err());
        assert!(DescRing::attach(&region, 1024).is_ok());
        assert!(DescRing::attach(&region, 7).is_err());
    }

    #[test]
    fn shared_across_mappings() {
        let region = Arc::new(SharedRegion::create(4096).unwrap());
        let producer = DescRing::init_at(&region, 0).unwrap();
        let peer = Arc::new(SharedRegion::map(region.handle().unwrap()).unwrap());
        let consumer = DescRing::attach(&peer, 0).unwrap();
        producer.try_push(&FrameDesc::new(64, 32, 7)).unwrap();
        let got = consumer.pop().unwrap();
        assert_eq!((got.offset, got.length, got.cookie), (64, 32, 7));
    }
}
