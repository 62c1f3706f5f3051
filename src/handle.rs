//! Wire identities: object ids, generations, and future ids.
//!
//! An [`ObjectHandle`] names a remote object as an `(id, generation)` pair.
//! Ids are dense per object kind and per side; the generation counts how many
//! times the id slot has been recycled, so a reference captured before a
//! destroy can never alias a newer allocation. `(0, 0)` is the universal null
//! sentinel and is never produced by a real allocation.

/// Id of an object within one kind's table. 0 is null.
pub type ObjectId = u32;

/// Per-id reuse counter.
pub type Generation = u32;

/// Process-wide monotonic id of an asynchronous operation. Never reused.
/// 0 is null.
pub type FutureId = u64;

/// `(id, generation)` pair naming a remote object on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    pub id: ObjectId,
    pub generation: Generation,
}

impl ObjectHandle {
    pub const NULL: ObjectHandle = ObjectHandle {
        id: 0,
        generation: 0,
    };

    /// Size of the wire form: `u32 id` + `u32 generation`, little-endian.
    pub const WIRE_SIZE: usize = 8;

    pub const fn new(id: ObjectId, generation: Generation) -> Self {
        Self { id, generation }
    }

    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

/// Object kinds with independent id spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Device,
    Buffer,
}

impl ObjectKind {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ObjectKind::Device => 0,
            ObjectKind::Buffer => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ObjectKind::Device,
            1 => ObjectKind::Buffer,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_id_zero() {
        assert!(ObjectHandle::NULL.is_null());
        assert!(ObjectHandle::new(0, 3).is_null());
        assert!(!ObjectHandle::new(1, 0).is_null());
    }

    #[test]
    fn object_kind_round_trips() {
        for kind in [ObjectKind::Device, ObjectKind::Buffer] {
            assert_eq!(ObjectKind::from_u8(kind.to_u8()), Some(kind));
        }
        assert_eq!(ObjectKind::from_u8(2), None);
    }
}
