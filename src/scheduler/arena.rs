//! Per-CPU arena of scheduling entries
//!
//! Entries are addressed by generation-checked handles. A handle that
//! outlives its entry simply stops resolving, which is how commands for
//! threads that were already reaped get dropped.

use alloc::vec::Vec;

use crate::platform::CpuId;

use super::types::SchedulingData;

const INDEX_BITS: u32 = 24;
const GEN_BITS: u32 = 24;
const CORE_BITS: u32 = 15;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const GEN_MASK: u64 = (1 << GEN_BITS) - 1;
const CORE_MASK: u64 = (1 << CORE_BITS) - 1;
const PRESENT: u64 = 1 << 63;

/// Largest number of slots one arena hands out
pub const MAX_ENTRIES: usize = 1 << INDEX_BITS;

/// Reference to one entry of one CPU's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedHandle {
    core: CpuId,
    index: u32,
    generation: u32,
}

impl SchedHandle {
    #[inline]
    pub fn core(&self) -> CpuId {
        self.core
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a nonzero word so threads can hold their handle in an atomic.
    pub fn into_raw(self) -> u64 {
        PRESENT
            | ((self.core as u64 & CORE_MASK) << (INDEX_BITS + GEN_BITS))
            | ((self.index as u64 & INDEX_MASK) << GEN_BITS)
            | (self.generation as u64 & GEN_MASK)
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw & PRESENT == 0 {
            return None;
        }
        Some(Self {
            core: ((raw >> (INDEX_BITS + GEN_BITS)) & CORE_MASK) as CpuId,
            index: ((raw >> GEN_BITS) & INDEX_MASK) as u32,
            generation: (raw & GEN_MASK) as u32,
        })
    }
}

struct Slot {
    generation: u32,
    data: Option<SchedulingData>,
}

pub struct SchedArena {
    core: CpuId,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl SchedArena {
    pub const fn new(core: CpuId) -> Self {
        Self {
            core,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, data: SchedulingData) -> SchedHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_ENTRIES {
                    crate::kpanic!("scheduler arena of CPU {} is full", self.core);
                }
                self.slots.push(Slot {
                    generation: 0,
                    data: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.data = Some(data);
        self.live += 1;
        SchedHandle {
            core: self.core,
            index,
            generation: slot.generation,
        }
    }

    /// Free the entry. Every outstanding handle to it goes stale.
    pub fn remove(&mut self, handle: SchedHandle) -> Option<SchedulingData> {
        let slot = self.slot_mut(handle)?;
        let data = slot.data.take()?;
        slot.generation = (slot.generation + 1) & GEN_MASK as u32;
        self.free.push(handle.index);
        self.live -= 1;
        Some(data)
    }

    pub fn get(&self, handle: SchedHandle) -> Option<&SchedulingData> {
        if handle.core != self.core {
            return None;
        }
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.data.as_ref()
    }

    pub fn get_mut(&mut self, handle: SchedHandle) -> Option<&mut SchedulingData> {
        self.slot_mut(handle)?.data.as_mut()
    }

    #[inline]
    pub fn contains(&self, handle: SchedHandle) -> bool {
        self.get(handle).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SchedulingData> {
        self.slots.iter_mut().filter_map(|slot| slot.data.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchedulingData> {
        self.slots.iter().filter_map(|slot| slot.data.as_ref())
    }

    fn slot_mut(&mut self, handle: SchedHandle) -> Option<&mut Slot> {
        if handle.core != self.core {
            return None;
        }
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_raw_roundtrip() {
        let handle = SchedHandle {
            core: 7,
            index: 1234,
            generation: 99,
        };
        assert_eq!(SchedHandle::from_raw(handle.into_raw()), Some(handle));
        assert_eq!(SchedHandle::from_raw(0), None);
    }

    #[test]
    fn test_handle_zero_fields_still_present() {
        let handle = SchedHandle {
            core: 0,
            index: 0,
            generation: 0,
        };
        assert_ne!(handle.into_raw(), 0);
        assert_eq!(SchedHandle::from_raw(handle.into_raw()), Some(handle));
    }
}
