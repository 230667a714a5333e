//! Fixed transmit buffer pool.
//!
//! One pool per session, sized to the transmit ring capacity so correct
//! client flow control can never exhaust it: the client cannot have more
//! descriptors outstanding than the ring holds. Slots are borrowed when a
//! transmit descriptor is accepted and returned the instant the completion
//! fires; nothing is allocated or freed on the hot path.
//!
//! Each slot carries a generation counter so a completion that arrives with
//! a recycled handle is rejected instead of corrupting the pool.

use ethmux_core::SlotHandle;
use parking_lot::Mutex;

/// Errors from pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is borrowed. Fatal backpressure: with the pool sized to
    /// the ring this cannot happen under correct flow control.
    Exhausted,
    /// The handle's index is outside the pool.
    BadIndex,
    /// The slot was recycled since the handle was issued.
    StaleGeneration,
    /// The slot is not currently borrowed.
    NotBorrowed,
}

/// Descriptor fields remembered across the asynchronous transmit, echoed
/// back to the client on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxMeta {
    pub offset: u32,
    pub length: u32,
}

struct Slot {
    generation: u32,
    borrowed: bool,
    meta: TxMeta,
}

struct PoolInner {
    free: Vec<u32>,
    slots: Vec<Slot>,
}

/// The fixed transmit slot pool.
pub struct TxPool {
    inner: Mutex<PoolInner>,
}

impl TxPool {
    /// Allocate all `capacity` slots up front.
    pub fn new(capacity: u32) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                borrowed: false,
                meta: TxMeta { offset: 0, length: 0 },
            })
            .collect();
        // Hand out low indices first.
        let free = (0..capacity).rev().collect();
        Self {
            inner: Mutex::new(PoolInner { free, slots }),
        }
    }

    /// Borrow a slot for one transmit, recording the descriptor fields to
    /// echo on completion.
    pub fn try_borrow(&self, meta: TxMeta) -> Result<SlotHandle, PoolError> {
        let mut inner = self.inner.lock();
        let index = inner.free.pop().ok_or(PoolError::Exhausted)?;
        let slot = &mut inner.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.borrowed = true;
        slot.meta = meta;
        Ok(SlotHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Return a slot at completion time.
    pub fn release(&self, handle: SlotHandle) -> Result<TxMeta, PoolError> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(handle.index as usize)
            .ok_or(PoolError::BadIndex)?;
        if slot.generation != handle.generation {
            return Err(PoolError::StaleGeneration);
        }
        if !slot.borrowed {
            return Err(PoolError::NotBorrowed);
        }
        slot.borrowed = false;
        let meta = slot.meta;
        inner.free.push(handle.index);
        Ok(meta)
    }

    /// Slots currently borrowed.
    pub fn borrowed(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    pub fn capacity(&self) -> u32 {
        self.inner.lock().slots.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const META: TxMeta = TxMeta {
        offset: 256,
        length: 64,
    };

    #[test]
    fn borrow_and_release_round_trip() {
        let pool = TxPool::new(4);
        let slot = pool.try_borrow(META).unwrap();
        assert_eq!(pool.borrowed(), 1);
        assert_eq!(pool.release(slot).unwrap(), META);
        assert_eq!(pool.borrowed(), 0);
    }

    #[test]
    fn exhaustion_at_capacity() {
        let pool = TxPool::new(2);
        let a = pool.try_borrow(META).unwrap();
        let _b = pool.try_borrow(META).unwrap();
        assert_eq!(pool.try_borrow(META), Err(PoolError::Exhausted));
        pool.release(a).unwrap();
        assert!(pool.try_borrow(META).is_ok());
    }

    #[test]
    fn stale_generation_rejected() {
        let pool = TxPool::new(1);
        let first = pool.try_borrow(META).unwrap();
        pool.release(first).unwrap();
        let second = pool.try_borrow(META).unwrap();
        // The recycled slot has a new generation; the old handle is dead.
        assert_eq!(pool.release(first), Err(PoolError::StaleGeneration));
        pool.release(second).unwrap();
    }

    #[test]
    fn double_release_rejected() {
        let pool = TxPool::new(1);
        let slot = pool.try_borrow(META).unwrap();
        pool.release(slot).unwrap();
        assert_eq!(pool.release(slot), Err(PoolError::NotBorrowed));
    }

    #[test]
    fn bad_index_rejected() {
        let pool = TxPool::new(1);
        let bogus = SlotHandle {
            index: 7,
            generation: 1,
        };
        assert_eq!(pool.release(bogus), Err(PoolError::BadIndex));
    }
}
