use thiserror::Error;

use crate::handle::{Generation, ObjectId};

pub type Result<T> = std::result::Result<T, WireError>;

/// Fatal protocol errors.
///
/// Any of these means the byte stream can no longer be trusted; the endpoint
/// that observes one must tear down the connection. Operation-level failures
/// (map rejected, allocation failed, device lost) are *not* represented here;
/// they travel through per-operation status enums instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown command tag 0x{0:08X}")]
    UnknownTag(u32),

    #[error("truncated command (tag 0x{tag:08X}: {got} of {expected} fixed bytes)")]
    TruncatedCommand { tag: u32, expected: usize, got: usize },

    #[error("command has {trailing} undeclared trailing bytes (tag 0x{tag:08X})")]
    TrailingBytes { tag: u32, trailing: usize },

    #[error("trailing payload of {len} bytes exceeds limit {max} (tag 0x{tag:08X})")]
    OversizedTrailer { tag: u32, len: usize, max: usize },

    #[error("trailing payload length {got} does not match declared {expected} (tag 0x{tag:08X})")]
    TrailerLengthMismatch { tag: u32, expected: usize, got: usize },

    #[error("truncated command stream ({pending} pending bytes)")]
    TruncatedStream { pending: usize },

    #[error("invalid enum value {value} in {context}")]
    InvalidEnum { context: &'static str, value: u32 },

    #[error("null object reference where a live object is required")]
    NullReference,

    #[error("unknown object id {id}")]
    UnknownId { id: ObjectId },

    #[error("stale reference to id {id}: generation {got}, table has {current}")]
    StaleReference {
        id: ObjectId,
        got: Generation,
        current: Generation,
    },

    #[error("object id {id} is already live; duplicate allocation")]
    DuplicateId { id: ObjectId },

    #[error("reply references unknown or mismatched state for id {id}")]
    UnexpectedReply { id: ObjectId },

    #[error("command not legal for object {id} in its current state")]
    InvalidState { id: ObjectId },
}
