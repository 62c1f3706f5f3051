//! Object table and id allocator.
//!
//! A dense slot array indexed by id plus a min-heap of recycled ids: the
//! allocator prefers the lowest free id over growing the table, and bumps the
//! slot's generation on every reuse so references captured before a destroy
//! can never alias the new occupant. Freed ids enter a pending-destroy batch
//! and only become allocatable again when the batch is taken for flushing,
//! which bounds how long a remote mirror can lag behind.
//!
//! The same type serves both sides of the wire: the client allocates ids
//! ([`ObjectTable::allocate`] / [`ObjectTable::free`]), the server mirrors
//! them at client-chosen positions ([`ObjectTable::allocate_at`] /
//! [`ObjectTable::release`]) and validates every incoming reference through
//! [`ObjectTable::resolve`].

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::WireError;
use crate::handle::{ObjectHandle, ObjectId};

#[derive(Debug)]
enum SlotState<T> {
    /// Never allocated, or released after a destroy batch round trip.
    Vacant,
    Live(T),
    /// Freed locally; id not yet recycled.
    Destroyed,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    state: SlotState<T>,
}

#[derive(Debug)]
pub struct ObjectTable<T> {
    /// `slots[id - 1]`; id 0 is the null sentinel and has no slot.
    slots: Vec<Slot<T>>,
    free: BinaryHeap<Reverse<ObjectId>>,
    pending_destroy: Vec<ObjectId>,
}

impl<T> Default for ObjectTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BinaryHeap::new(),
            pending_destroy: Vec::new(),
        }
    }

    fn slot(&self, id: ObjectId) -> Option<&Slot<T>> {
        if id == 0 {
            return None;
        }
        self.slots.get(id as usize - 1)
    }

    fn slot_mut(&mut self, id: ObjectId) -> Option<&mut Slot<T>> {
        if id == 0 {
            return None;
        }
        self.slots.get_mut(id as usize - 1)
    }

    /// Allocates a record, preferring the lowest recycled id over growing
    /// the table. Reuse increments the slot's generation.
    pub fn allocate(&mut self, record: T) -> ObjectHandle {
        if let Some(Reverse(id)) = self.free.pop() {
            let slot = self.slot_mut(id).expect("recycled id has a slot");
            slot.generation = slot.generation.wrapping_add(1);
            slot.state = SlotState::Live(record);
            return ObjectHandle::new(id, slot.generation);
        }

        self.slots.push(Slot {
            generation: 0,
            state: SlotState::Live(record),
        });
        ObjectHandle::new(self.slots.len() as ObjectId, 0)
    }

    /// O(1) lookup of a live record; `None` for id 0, never-allocated ids,
    /// and retired slots.
    pub fn get(&self, id: ObjectId) -> Option<&T> {
        match self.slot(id) {
            Some(Slot {
                state: SlotState::Live(record),
                ..
            }) => Some(record),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut T> {
        match self.slot_mut(id) {
            Some(Slot {
                state: SlotState::Live(record),
                ..
            }) => Some(record),
            _ => None,
        }
    }

    /// Trust-boundary lookup: the reference is honored only if the
    /// generation matches the slot's current value.
    pub fn resolve(&self, handle: ObjectHandle) -> Result<&T, WireError> {
        if handle.is_null() {
            return Err(WireError::NullReference);
        }
        let slot = self
            .slot(handle.id)
            .ok_or(WireError::UnknownId { id: handle.id })?;
        if slot.generation != handle.generation {
            return Err(WireError::StaleReference {
                id: handle.id,
                got: handle.generation,
                current: slot.generation,
            });
        }
        match &slot.state {
            SlotState::Live(record) => Ok(record),
            _ => Err(WireError::UnknownId { id: handle.id }),
        }
    }

    pub fn resolve_mut(&mut self, handle: ObjectHandle) -> Result<&mut T, WireError> {
        // Borrow-checker friendly mirror of `resolve`.
        self.resolve(handle)?;
        match self.slot_mut(handle.id) {
            Some(Slot {
                state: SlotState::Live(record),
                ..
            }) => Ok(record),
            _ => unreachable!("resolve checked liveness"),
        }
    }

    /// Marks the record destroyed and queues its id for the next destroy
    /// batch. The id is not allocatable again until the batch is taken.
    pub fn free(&mut self, handle: ObjectHandle) -> Result<T, WireError> {
        self.resolve(handle)?;
        let slot = self.slot_mut(handle.id).expect("resolve checked the slot");
        let state = std::mem::replace(&mut slot.state, SlotState::Destroyed);
        self.pending_destroy.push(handle.id);
        match state {
            SlotState::Live(record) => Ok(record),
            _ => unreachable!("resolve checked liveness"),
        }
    }

    pub fn pending_destroy_len(&self) -> usize {
        self.pending_destroy.len()
    }

    /// Takes the queued destroy notifications, recycling their ids. The
    /// caller must put the returned handles on the wire before any command
    /// that could reference a reallocated id, i.e. immediately.
    pub fn take_destroy_batch(&mut self) -> Vec<ObjectHandle> {
        let ids = std::mem::take(&mut self.pending_destroy);
        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            let generation = self.slot(id).expect("freed id has a slot").generation;
            batch.push(ObjectHandle::new(id, generation));
            self.free.push(Reverse(id));
        }
        batch
    }

    /// Server path: mirrors a client allocation at the client-chosen id and
    /// generation. Overwriting a live slot is a protocol violation.
    pub fn allocate_at(&mut self, handle: ObjectHandle, record: T) -> Result<(), WireError> {
        if handle.is_null() {
            return Err(WireError::NullReference);
        }
        let index = handle.id as usize - 1;
        while self.slots.len() <= index {
            self.slots.push(Slot {
                generation: 0,
                state: SlotState::Vacant,
            });
        }
        let slot = &mut self.slots[index];
        if matches!(slot.state, SlotState::Live(_)) {
            return Err(WireError::DuplicateId { id: handle.id });
        }
        slot.generation = handle.generation;
        slot.state = SlotState::Live(record);
        Ok(())
    }

    /// Server path: drops the mirror record after the client's destroy batch
    /// announced the id was retired.
    pub fn release(&mut self, handle: ObjectHandle) -> Result<T, WireError> {
        self.resolve(handle)?;
        let slot = self.slot_mut(handle.id).expect("resolve checked the slot");
        match std::mem::replace(&mut slot.state, SlotState::Vacant) {
            SlotState::Live(record) => Ok(record),
            _ => unreachable!("resolve checked liveness"),
        }
    }

    /// Drains every live record, retiring the whole table. Used on teardown.
    pub fn drain_live(&mut self) -> Vec<(ObjectHandle, T)> {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot.state, SlotState::Live(_)) {
                if let SlotState::Live(record) =
                    std::mem::replace(&mut slot.state, SlotState::Vacant)
                {
                    out.push((
                        ObjectHandle::new(index as ObjectId + 1, slot.generation),
                        record,
                    ));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_id_is_preferred() {
        let mut table = ObjectTable::new();
        let a = table.allocate("a");
        let b = table.allocate("b");
        let c = table.allocate("c");
        assert_eq!((a.id, b.id, c.id), (1, 2, 3));

        table.free(a).unwrap();
        table.free(c).unwrap();
        assert!(table.take_destroy_batch().len() == 2);

        // Reuse picks id 1 before id 3 and bumps the generation.
        let d = table.allocate("d");
        assert_eq!((d.id, d.generation), (1, 1));
        let e = table.allocate("e");
        assert_eq!((e.id, e.generation), (3, 1));
    }

    #[test]
    fn freed_id_not_reused_before_batch_taken() {
        let mut table = ObjectTable::new();
        let a = table.allocate(());
        table.free(a).unwrap();
        // Batch not taken yet: the table must grow instead of recycling.
        let b = table.allocate(());
        assert_eq!(b.id, 2);
    }

    #[test]
    fn resolve_reports_stale_after_reuse() {
        let mut table = ObjectTable::new();
        let old = table.allocate(());
        table.free(old).unwrap();
        table.take_destroy_batch();
        let new = table.allocate(());
        assert_eq!(new, ObjectHandle::new(old.id, old.generation + 1));

        let err = table.resolve(old).unwrap_err();
        assert_eq!(
            err,
            WireError::StaleReference {
                id: old.id,
                got: old.generation,
                current: new.generation,
            }
        );
        assert!(table.resolve(new).is_ok());
    }

    #[test]
    fn allocate_at_rejects_live_slot() {
        let mut table = ObjectTable::new();
        table.allocate_at(ObjectHandle::new(4, 0), ()).unwrap();
        assert_eq!(
            table.allocate_at(ObjectHandle::new(4, 1), ()),
            Err(WireError::DuplicateId { id: 4 })
        );
        // Ids below the mirrored one exist as vacant slots only.
        assert_eq!(
            table.resolve(ObjectHandle::new(2, 0)),
            Err(WireError::UnknownId { id: 2 })
        );
    }
}
