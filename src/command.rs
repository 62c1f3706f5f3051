//! Typed wire commands and their byte codec.
//!
//! Every command is one self-describing unit:
//!
//! ```text
//! {u32 tag}{fixed fields}{u32 trailing-len}{trailing bytes}
//! ```
//!
//! repeated on the stream, all integers little-endian. The fixed-field size
//! is a function of the tag ([`fixed_len`]), which is what lets the
//! incremental reassembly in [`crate::stream`] know how much to buffer
//! without trusting anything beyond the declared trailing length.
//!
//! [`Command`] flows client→server; [`ReturnCommand`] flows server→client.

use bitflags::bitflags;

use crate::error::WireError;
use crate::handle::{FutureId, ObjectHandle, ObjectKind};

/// Whole-buffer map size sentinel; resolves to `size - offset` at request time.
pub const WHOLE_SIZE: u64 = u64::MAX;

/// Mapped-range offsets must be multiples of this.
pub const MAP_OFFSET_ALIGNMENT: u64 = 8;
/// Mapped-range sizes must be multiples of this.
pub const MAP_SIZE_ALIGNMENT: u64 = 4;

pub const CMD_REQUEST_DEVICE: u32 = 0x0001;
pub const CMD_CREATE_BUFFER: u32 = 0x0010;
pub const CMD_BUFFER_MAP_ASYNC: u32 = 0x0011;
pub const CMD_BUFFER_UPDATE_MAPPED: u32 = 0x0012;
pub const CMD_BUFFER_UNMAP: u32 = 0x0013;
pub const CMD_BUFFER_DESTROY: u32 = 0x0014;
pub const CMD_FREE_OBJECTS: u32 = 0x0020;

pub const RET_REQUEST_DEVICE: u32 = 0x1001;
pub const RET_BUFFER_MAP_ASYNC: u32 = 0x1010;

bitflags! {
    /// Buffer usage flags. Only the mapping-relevant subset of the GPU API
    /// is modeled; the rest rides along as opaque bits for the backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsages: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
    }
}

/// Direction of a map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

impl MapMode {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            MapMode::Read => 0,
            MapMode::Write => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => MapMode::Read,
            1 => MapMode::Write,
            _ => {
                return Err(WireError::InvalidEnum {
                    context: "map mode",
                    value: v as u32,
                })
            }
        })
    }
}

/// Outcome of a `buffer_map_async` request, delivered through its callback
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAsyncStatus {
    Success,
    /// Rejected by validation (bad range, bad alignment, wrong usage,
    /// already mapped, backend refused).
    ValidationError,
    /// A map request is already in flight for this buffer.
    MappingAlreadyPending,
    /// The buffer was unmapped before the server round trip resolved.
    UnmappedBeforeCallback,
    /// The buffer was destroyed before the server round trip resolved.
    DestroyedBeforeCallback,
    /// The connection went away before the request resolved.
    DeviceLost,
}

impl MapAsyncStatus {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            MapAsyncStatus::Success => 0,
            MapAsyncStatus::ValidationError => 1,
            MapAsyncStatus::MappingAlreadyPending => 2,
            MapAsyncStatus::UnmappedBeforeCallback => 3,
            MapAsyncStatus::DestroyedBeforeCallback => 4,
            MapAsyncStatus::DeviceLost => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => MapAsyncStatus::Success,
            1 => MapAsyncStatus::ValidationError,
            2 => MapAsyncStatus::MappingAlreadyPending,
            3 => MapAsyncStatus::UnmappedBeforeCallback,
            4 => MapAsyncStatus::DestroyedBeforeCallback,
            5 => MapAsyncStatus::DeviceLost,
            _ => {
                return Err(WireError::InvalidEnum {
                    context: "map async status",
                    value: v as u32,
                })
            }
        })
    }
}

/// Outcome of a `request_device` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDeviceStatus {
    Success,
    /// The backend refused to create a device. The pre-allocated handle
    /// remains a valid (but defunct) reference until released.
    Failure,
    /// The connection went away before the request resolved.
    Shutdown,
}

impl RequestDeviceStatus {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            RequestDeviceStatus::Success => 0,
            RequestDeviceStatus::Failure => 1,
            RequestDeviceStatus::Shutdown => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => RequestDeviceStatus::Success,
            1 => RequestDeviceStatus::Failure,
            2 => RequestDeviceStatus::Shutdown,
            _ => {
                return Err(WireError::InvalidEnum {
                    context: "request device status",
                    value: v as u32,
                })
            }
        })
    }
}

/// Client→server commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RequestDevice {
        result: ObjectHandle,
        future: FutureId,
    },
    CreateBuffer {
        device: ObjectHandle,
        result: ObjectHandle,
        size: u64,
        usage: BufferUsages,
        mapped_at_creation: bool,
    },
    BufferMapAsync {
        buffer: ObjectHandle,
        future: FutureId,
        mode: MapMode,
        offset: u64,
        size: u64,
    },
    /// Flush of locally staged writes for a mapped-for-write buffer. `data`
    /// covers exactly the `[offset, offset + data.len())` window.
    BufferUpdateMappedData {
        buffer: ObjectHandle,
        offset: u64,
        data: Vec<u8>,
    },
    BufferUnmap {
        buffer: ObjectHandle,
    },
    BufferDestroy {
        buffer: ObjectHandle,
    },
    /// Batched notification that the client retired these ids; the server
    /// drops its mirror records. Coalesced instead of one message per object.
    FreeObjects {
        kind: ObjectKind,
        handles: Vec<ObjectHandle>,
    },
}

/// Server→client reply commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnCommand {
    RequestDevice {
        future: FutureId,
        status: RequestDeviceStatus,
    },
    /// On a successful read map, `data` carries exactly the requested byte
    /// range; empty otherwise.
    BufferMapAsync {
        buffer: ObjectHandle,
        future: FutureId,
        status: MapAsyncStatus,
        data: Vec<u8>,
    },
}

/// Fixed-field byte count for a tag, or `UnknownTag`.
pub fn fixed_len(tag: u32) -> Result<usize, WireError> {
    Ok(match tag {
        CMD_REQUEST_DEVICE => ObjectHandle::WIRE_SIZE + 8,
        CMD_CREATE_BUFFER => 2 * ObjectHandle::WIRE_SIZE + 8 + 4 + 1,
        CMD_BUFFER_MAP_ASYNC => ObjectHandle::WIRE_SIZE + 8 + 1 + 8 + 8,
        CMD_BUFFER_UPDATE_MAPPED => ObjectHandle::WIRE_SIZE + 8 + 8,
        CMD_BUFFER_UNMAP | CMD_BUFFER_DESTROY => ObjectHandle::WIRE_SIZE,
        CMD_FREE_OBJECTS => 1 + 4,
        RET_REQUEST_DEVICE => 8 + 1,
        RET_BUFFER_MAP_ASYNC => ObjectHandle::WIRE_SIZE + 8 + 1,
        other => return Err(WireError::UnknownTag(other)),
    })
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_handle(out: &mut Vec<u8>, h: ObjectHandle) {
    push_u32(out, h.id);
    push_u32(out, h.generation);
}

/// Writes the trailing-length field and the trailing bytes. Trailer sizes
/// are bounded by [`crate::stream::Limits`] before anything reaches encode;
/// a silent `u32` truncation here would desynchronize the stream.
fn push_trailer(out: &mut Vec<u8>, data: &[u8]) {
    assert!(
        u32::try_from(data.len()).is_ok(),
        "trailing payload too large to declare"
    );
    push_u32(out, data.len() as u32);
    out.extend_from_slice(data);
}

/// Serializes one command: tag, fixed fields, trailing length, trailing bytes.
pub fn encode_command_into(cmd: &Command, out: &mut Vec<u8>) {
    match cmd {
        Command::RequestDevice { result, future } => {
            push_u32(out, CMD_REQUEST_DEVICE);
            push_handle(out, *result);
            push_u64(out, *future);
            push_u32(out, 0);
        }
        Command::CreateBuffer {
            device,
            result,
            size,
            usage,
            mapped_at_creation,
        } => {
            push_u32(out, CMD_CREATE_BUFFER);
            push_handle(out, *device);
            push_handle(out, *result);
            push_u64(out, *size);
            push_u32(out, usage.bits());
            out.push(u8::from(*mapped_at_creation));
            push_u32(out, 0);
        }
        Command::BufferMapAsync {
            buffer,
            future,
            mode,
            offset,
            size,
        } => {
            push_u32(out, CMD_BUFFER_MAP_ASYNC);
            push_handle(out, *buffer);
            push_u64(out, *future);
            out.push(mode.to_u8());
            push_u64(out, *offset);
            push_u64(out, *size);
            push_u32(out, 0);
        }
        Command::BufferUpdateMappedData {
            buffer,
            offset,
            data,
        } => {
            push_u32(out, CMD_BUFFER_UPDATE_MAPPED);
            push_handle(out, *buffer);
            push_u64(out, *offset);
            push_u64(out, data.len() as u64);
            push_trailer(out, data);
        }
        Command::BufferUnmap { buffer } => {
            push_u32(out, CMD_BUFFER_UNMAP);
            push_handle(out, *buffer);
            push_u32(out, 0);
        }
        Command::BufferDestroy { buffer } => {
            push_u32(out, CMD_BUFFER_DESTROY);
            push_handle(out, *buffer);
            push_u32(out, 0);
        }
        Command::FreeObjects { kind, handles } => {
            let trailer = handles.len() * ObjectHandle::WIRE_SIZE;
            assert!(
                u32::try_from(trailer).is_ok(),
                "free batch too large to declare"
            );
            push_u32(out, CMD_FREE_OBJECTS);
            out.push(kind.to_u8());
            push_u32(out, handles.len() as u32);
            push_u32(out, trailer as u32);
            for h in handles {
                push_handle(out, *h);
            }
        }
    }
}

pub fn encode_return_into(ret: &ReturnCommand, out: &mut Vec<u8>) {
    match ret {
        ReturnCommand::RequestDevice { future, status } => {
            push_u32(out, RET_REQUEST_DEVICE);
            push_u64(out, *future);
            out.push(status.to_u8());
            push_u32(out, 0);
        }
        ReturnCommand::BufferMapAsync {
            buffer,
            future,
            status,
            data,
        } => {
            push_u32(out, RET_BUFFER_MAP_ASYNC);
            push_handle(out, *buffer);
            push_u64(out, *future);
            out.push(status.to_u8());
            push_trailer(out, data);
        }
    }
}

/// Decodes the fixed fields + trailing payload of a client→server command.
///
/// The caller (the reassembly layer) has already framed `fixed` and
/// `trailing` from the stream; this validates every field and the trailing
/// length against the fixed fields that declare it.
pub fn decode_command(tag: u32, fixed: &[u8], trailing: &[u8]) -> Result<Command, WireError> {
    let mut r = Reader::new(tag, fixed);
    let cmd = match tag {
        CMD_REQUEST_DEVICE => {
            let cmd = Command::RequestDevice {
                result: r.read_handle()?,
                future: r.read_u64()?,
            };
            expect_no_trailing(tag, trailing)?;
            cmd
        }
        CMD_CREATE_BUFFER => {
            let device = r.read_handle()?;
            let result = r.read_handle()?;
            let size = r.read_u64()?;
            let bits = r.read_u32()?;
            let usage = BufferUsages::from_bits(bits).ok_or(WireError::InvalidEnum {
                context: "buffer usage",
                value: bits,
            })?;
            let mapped_at_creation = read_bool(&mut r, "mapped_at_creation flag")?;
            expect_no_trailing(tag, trailing)?;
            Command::CreateBuffer {
                device,
                result,
                size,
                usage,
                mapped_at_creation,
            }
        }
        CMD_BUFFER_MAP_ASYNC => {
            let cmd = Command::BufferMapAsync {
                buffer: r.read_handle()?,
                future: r.read_u64()?,
                mode: MapMode::from_u8(r.read_u8()?)?,
                offset: r.read_u64()?,
                size: r.read_u64()?,
            };
            expect_no_trailing(tag, trailing)?;
            cmd
        }
        CMD_BUFFER_UPDATE_MAPPED => {
            let buffer = r.read_handle()?;
            let offset = r.read_u64()?;
            let size = r.read_u64()?;
            if trailing.len() as u64 != size {
                return Err(WireError::TrailerLengthMismatch {
                    tag,
                    expected: size as usize,
                    got: trailing.len(),
                });
            }
            Command::BufferUpdateMappedData {
                buffer,
                offset,
                data: trailing.to_vec(),
            }
        }
        CMD_BUFFER_UNMAP => {
            let cmd = Command::BufferUnmap {
                buffer: r.read_handle()?,
            };
            expect_no_trailing(tag, trailing)?;
            cmd
        }
        CMD_BUFFER_DESTROY => {
            let cmd = Command::BufferDestroy {
                buffer: r.read_handle()?,
            };
            expect_no_trailing(tag, trailing)?;
            cmd
        }
        CMD_FREE_OBJECTS => {
            let kind_raw = r.read_u8()?;
            let kind = ObjectKind::from_u8(kind_raw).ok_or(WireError::InvalidEnum {
                context: "object kind",
                value: kind_raw as u32,
            })?;
            let count = r.read_u32()? as usize;
            let expected = count * ObjectHandle::WIRE_SIZE;
            if trailing.len() != expected {
                return Err(WireError::TrailerLengthMismatch {
                    tag,
                    expected,
                    got: trailing.len(),
                });
            }
            let mut tr = Reader::new(tag, trailing);
            let mut handles = Vec::with_capacity(count);
            for _ in 0..count {
                handles.push(tr.read_handle()?);
            }
            Command::FreeObjects { kind, handles }
        }
        other => return Err(WireError::UnknownTag(other)),
    };
    r.finish()?;
    Ok(cmd)
}

/// Decodes a server→client reply command.
pub fn decode_return(tag: u32, fixed: &[u8], trailing: &[u8]) -> Result<ReturnCommand, WireError> {
    let mut r = Reader::new(tag, fixed);
    let ret = match tag {
        RET_REQUEST_DEVICE => {
            let ret = ReturnCommand::RequestDevice {
                future: r.read_u64()?,
                status: RequestDeviceStatus::from_u8(r.read_u8()?)?,
            };
            expect_no_trailing(tag, trailing)?;
            ret
        }
        RET_BUFFER_MAP_ASYNC => ReturnCommand::BufferMapAsync {
            buffer: r.read_handle()?,
            future: r.read_u64()?,
            status: MapAsyncStatus::from_u8(r.read_u8()?)?,
            data: trailing.to_vec(),
        },
        other => return Err(WireError::UnknownTag(other)),
    };
    r.finish()?;
    Ok(ret)
}

fn expect_no_trailing(tag: u32, trailing: &[u8]) -> Result<(), WireError> {
    if trailing.is_empty() {
        Ok(())
    } else {
        Err(WireError::TrailingBytes {
            tag,
            trailing: trailing.len(),
        })
    }
}

fn read_bool(r: &mut Reader<'_>, context: &'static str) -> Result<bool, WireError> {
    match r.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WireError::InvalidEnum {
            context,
            value: other as u32,
        }),
    }
}

/// Bounds-checked little-endian field reader over one command's bytes.
struct Reader<'a> {
    tag: u32,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(tag: u32, bytes: &'a [u8]) -> Self {
        Self { tag, bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::TruncatedCommand {
                tag: self.tag,
                expected: self.pos + len,
                got: self.bytes.len(),
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, WireError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_handle(&mut self) -> Result<ObjectHandle, WireError> {
        let id = self.read_u32()?;
        let generation = self.read_u32()?;
        Ok(ObjectHandle { id, generation })
    }

    fn finish(self) -> Result<(), WireError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(WireError::TrailingBytes {
                tag: self.tag,
                trailing: self.remaining(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> (u32, Vec<u8>, Vec<u8>) {
        // Split an encoded command the way the stream layer would.
        let tag = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let fixed = fixed_len(tag).unwrap();
        let fixed_bytes = bytes[4..4 + fixed].to_vec();
        let trailing = bytes[4 + fixed + 4..].to_vec();
        (tag, fixed_bytes, trailing)
    }

    #[test]
    fn map_async_round_trip() {
        let cmd = Command::BufferMapAsync {
            buffer: ObjectHandle::new(5, 2),
            future: 77,
            mode: MapMode::Read,
            offset: 8,
            size: 1024,
        };
        let mut bytes = Vec::new();
        encode_command_into(&cmd, &mut bytes);
        let (tag, fixed, trailing) = frame(&bytes);
        assert_eq!(decode_command(tag, &fixed, &trailing).unwrap(), cmd);
    }

    #[test]
    fn update_mapped_length_mismatch_is_fatal() {
        let cmd = Command::BufferUpdateMappedData {
            buffer: ObjectHandle::new(1, 0),
            offset: 0,
            data: vec![1, 2, 3, 4],
        };
        let mut bytes = Vec::new();
        encode_command_into(&cmd, &mut bytes);
        let (tag, mut fixed, trailing) = frame(&bytes);
        // Corrupt the declared size field.
        fixed[16..24].copy_from_slice(&8u64.to_le_bytes());
        assert!(matches!(
            decode_command(tag, &fixed, &trailing),
            Err(WireError::TrailerLengthMismatch { .. })
        ));
    }

    #[test]
    fn bad_usage_bits_are_fatal() {
        let cmd = Command::CreateBuffer {
            device: ObjectHandle::new(1, 0),
            result: ObjectHandle::new(1, 0),
            size: 16,
            usage: BufferUsages::MAP_READ,
            mapped_at_creation: false,
        };
        let mut bytes = Vec::new();
        encode_command_into(&cmd, &mut bytes);
        let (tag, mut fixed, trailing) = frame(&bytes);
        fixed[24..28].copy_from_slice(&0xFFFF_0000u32.to_le_bytes());
        assert!(matches!(
            decode_command(tag, &fixed, &trailing),
            Err(WireError::InvalidEnum { .. })
        ));
    }
}
