//! In-memory model of the transmit slot pool for property testing.
//!
//! Replicates the pool algorithm (free list plus per-slot generation
//! counters) and tracks every handle ever issued so the fuzzer can aim
//! stale and double releases at it.

/// Minimum pool size for fuzzing.
pub const MIN_SLOTS: u32 = 2;
/// Maximum pool size for fuzzing (small pools exhaust sooner).
pub const MAX_SLOTS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    Exhausted,
    BadIndex,
    StaleGeneration,
    NotBorrowed,
}

struct Slot {
    generation: u32,
    borrowed: bool,
}

/// Model of the pool.
pub struct PoolModel {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl PoolModel {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    generation: 0,
                    borrowed: false,
                })
                .collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn borrow(&mut self) -> Result<Handle, PoolError> {
        let index = self.free.pop().ok_or(PoolError::Exhausted)?;
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.borrowed = true;
        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    pub fn release(&mut self, handle: Handle) -> Result<(), PoolError> {
        let slot = self
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
        self.free.push(handle.index);
        Ok(())
    }

    pub fn borrowed(&self) -> usize {
        self.slots.iter().filter(|s| s.borrowed).count()
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }
}

/// Operations the fuzzer drives. Release picks among live handles by index
/// so sequences stay meaningful regardless of what borrow returned.
#[derive(Clone, Copy, Debug)]
pub enum PoolOp {
    Borrow,
    /// Release the nth live handle (modulo the live count).
    Release(u8),
    /// Release a handle that was already released (if any exist).
    ReleaseStale(u8),
}

/// Run an operation sequence, checking invariants after every step.
pub fn execute_and_verify(capacity: u32, ops: &[PoolOp]) -> Result<(), String> {
    let mut pool = PoolModel::new(capacity);
    let mut live: Vec<Handle> = Vec::new();
    let mut retired: Vec<Handle> = Vec::new();

    for (i, op) in ops.iter().enumerate() {
        match op {
            PoolOp::Borrow => match pool.borrow() {
                Ok(handle) => {
                    if handle.index >= capacity {
                        return Err(format!("op {i}: handle index {} out of range", handle.index));
                    }
                    if live.iter().any(|h| h.index == handle.index) {
                        return Err(format!(
                            "op {i}: slot {} double-borrowed",
                            handle.index
                        ));
                    }
                    live.push(handle);
                }
                Err(PoolError::Exhausted) => {
                    if live.len() < capacity as usize {
                        return Err(format!(
                            "op {i}: exhausted at {} of {} slots",
                            live.len(),
                            capacity
                        ));
                    }
                }
                Err(err) => return Err(format!("op {i}: unexpected borrow error {err:?}")),
            },
            PoolOp::Release(pick) => {
                if live.is_empty() {
                    continue;
                }
                let handle = live.remove(*pick as usize % live.len());
                pool.release(handle)
                    .map_err(|err| format!("op {i}: live release failed: {err:?}"))?;
                retired.push(handle);
            }
            PoolOp::ReleaseStale(pick) => {
                if retired.is_empty() {
                    continue;
                }
                let handle = retired[*pick as usize % retired.len()];
                match pool.release(handle) {
                    // A retired handle must never release again: either the
                    // slot was recycled (stale) or it sits free (not
                    // borrowed).
                    Err(PoolError::StaleGeneration) | Err(PoolError::NotBorrowed) => {}
                    Ok(()) => {
                        return Err(format!(
                            "op {i}: retired handle {handle:?} released twice"
                        ));
                    }
                    Err(err) => {
                        return Err(format!("op {i}: unexpected stale error {err:?}"));
                    }
                }
            }
        }

        if pool.borrowed() != live.len() {
            return Err(format!(
                "op {i}: borrowed {} diverged from live {}",
                pool.borrowed(),
                live.len()
            ));
        }
        if live.len() > capacity as usize {
            return Err(format!("op {i}: live count exceeds capacity"));
        }
    }

    Ok(())
}
