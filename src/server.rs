//! Server endpoint: dispatch of incoming commands against a GPU backend.
//!
//! The server mirrors the client's object tables at client-chosen ids,
//! resolves every incoming reference through generation checks before the
//! backend sees anything, and stages replies on its own writer. Reference
//! errors are fatal (the stream is no longer trustworthy); operation-level
//! failures travel back as statuses in reply commands.

use crate::command::{
    decode_command, encode_return_into, BufferUsages, Command, MapAsyncStatus, MapMode,
    RequestDeviceStatus, ReturnCommand,
};
use crate::error::{Result, WireError};
use crate::handle::{FutureId, ObjectHandle, ObjectKind};
use crate::stream::{CommandSink, CommandWriter, Limits, WireParser};
use crate::table::ObjectTable;

use thiserror::Error;

/// Operation-level backend failure. Never fatal to the connection; it is
/// folded into the reply status of the operation that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("backend validation failed: {0}")]
    Validation(&'static str),
}

/// The native GPU layer the server drives. Implementations are synchronous;
/// the wire layer supplies the asynchrony the client observes.
pub trait GpuBackend {
    type Buffer;

    fn request_device(&mut self) -> std::result::Result<(), BackendError>;

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsages,
    ) -> std::result::Result<Self::Buffer, BackendError>;

    fn buffer_read(
        &mut self,
        buffer: &Self::Buffer,
        offset: u64,
        out: &mut [u8],
    ) -> std::result::Result<(), BackendError>;

    fn buffer_write(
        &mut self,
        buffer: &mut Self::Buffer,
        offset: u64,
        data: &[u8],
    ) -> std::result::Result<(), BackendError>;

    fn destroy_buffer(&mut self, buffer: Self::Buffer);
}

#[derive(Debug)]
struct ServerDevice {
    /// False when the backend refused the device; buffers created against it
    /// become defunct records with no native backing.
    valid: bool,
}

/// Window a mapped-for-write buffer accepts data updates for.
#[derive(Debug, Clone, Copy)]
struct WriteWindow {
    offset: u64,
    size: u64,
}

struct ServerBuffer<N> {
    /// `None` after a destroy, or when creation failed and the record exists
    /// only to keep later references resolvable.
    native: Option<N>,
    size: u64,
    usage: BufferUsages,
    write_window: Option<WriteWindow>,
}

pub struct Server<B: GpuBackend> {
    backend: B,
    limits: Limits,
    devices: ObjectTable<ServerDevice>,
    buffers: ObjectTable<ServerBuffer<B::Buffer>>,
    writer: CommandWriter,
    parser: WireParser,
}

impl<B: GpuBackend> Server<B> {
    pub fn new(backend: B, limits: &Limits) -> Self {
        Self {
            backend,
            limits: *limits,
            devices: ObjectTable::new(),
            buffers: ObjectTable::new(),
            writer: CommandWriter::new(limits),
            parser: WireParser::new(limits),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn reply(&mut self, ret: &ReturnCommand) {
        self.writer.push_encoded(|out| encode_return_into(ret, out));
    }

    /// Processes client→server bytes. Chunk boundaries are arbitrary. A
    /// fatal [`WireError`] poisons the connection; the caller must tear it
    /// down and stop feeding bytes.
    pub fn handle_incoming(&mut self, chunk: &[u8]) -> Result<()> {
        let frames = self.parser.push(chunk)?;
        for frame in frames {
            let cmd = decode_command(frame.tag, &frame.fixed, &frame.trailing)?;
            tracing::trace!(tag = frame.tag, "dispatching command");
            if let Err(err) = self.dispatch(cmd) {
                tracing::warn!(%err, "fatal wire error, poisoning connection");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Drains staged replies to the transport.
    pub fn flush(&mut self, sink: &mut dyn CommandSink) {
        self.writer.flush(sink);
    }

    fn dispatch(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::RequestDevice { result, future } => self.do_request_device(result, future),
            Command::CreateBuffer {
                device,
                result,
                size,
                usage,
                mapped_at_creation,
            } => self.do_create_buffer(device, result, size, usage, mapped_at_creation),
            Command::BufferMapAsync {
                buffer,
                future,
                mode,
                offset,
                size,
            } => self.do_buffer_map_async(buffer, future, mode, offset, size),
            Command::BufferUpdateMappedData {
                buffer,
                offset,
                data,
            } => self.do_buffer_update_mapped(buffer, offset, &data),
            Command::BufferUnmap { buffer } => self.do_buffer_unmap(buffer),
            Command::BufferDestroy { buffer } => self.do_buffer_destroy(buffer),
            Command::FreeObjects { kind, handles } => self.do_free_objects(kind, handles),
        }
    }

    fn do_request_device(&mut self, result: ObjectHandle, future: FutureId) -> Result<()> {
        let status = match self.backend.request_device() {
            Ok(()) => RequestDeviceStatus::Success,
            Err(err) => {
                tracing::debug!(%err, "backend refused device");
                RequestDeviceStatus::Failure
            }
        };
        self.devices.allocate_at(
            result,
            ServerDevice {
                valid: status == RequestDeviceStatus::Success,
            },
        )?;
        self.reply(&ReturnCommand::RequestDevice { future, status });
        Ok(())
    }

    fn do_create_buffer(
        &mut self,
        device: ObjectHandle,
        result: ObjectHandle,
        size: u64,
        usage: BufferUsages,
        mapped_at_creation: bool,
    ) -> Result<()> {
        let device_ok = self.devices.resolve(device)?.valid;

        let native = if device_ok {
            match self.backend.create_buffer(size, usage) {
                Ok(native) => Some(native),
                Err(err) => {
                    tracing::debug!(%err, size, "backend buffer creation failed");
                    None
                }
            }
        } else {
            None
        };

        // The record is mirrored even when creation failed, so later
        // commands naming this id still resolve instead of killing the
        // connection.
        self.buffers.allocate_at(
            result,
            ServerBuffer {
                native,
                size,
                usage,
                write_window: mapped_at_creation.then_some(WriteWindow { offset: 0, size }),
            },
        )?;
        Ok(())
    }

    fn do_buffer_map_async(
        &mut self,
        buffer: ObjectHandle,
        future: FutureId,
        mode: MapMode,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        // A bad reference is fatal; everything past this point is an
        // operation-level failure reported through the reply status.
        self.buffers.resolve(buffer)?;

        let (status, data) = self.map_async_outcome(buffer, mode, offset, size);
        self.reply(&ReturnCommand::BufferMapAsync {
            buffer,
            future,
            status,
            data,
        });
        Ok(())
    }

    fn map_async_outcome(
        &mut self,
        buffer: ObjectHandle,
        mode: MapMode,
        offset: u64,
        size: u64,
    ) -> (MapAsyncStatus, Vec<u8>) {
        let Some(record) = self.buffers.get_mut(buffer.id) else {
            return (MapAsyncStatus::ValidationError, Vec::new());
        };
        if record.native.is_none() {
            return (MapAsyncStatus::ValidationError, Vec::new());
        }
        let in_range = offset
            .checked_add(size)
            .is_some_and(|end| end <= record.size);
        let usage_ok = match mode {
            MapMode::Read => record.usage.contains(BufferUsages::MAP_READ),
            MapMode::Write => record.usage.contains(BufferUsages::MAP_WRITE),
        };
        if !in_range || !usage_ok || record.write_window.is_some() {
            return (MapAsyncStatus::ValidationError, Vec::new());
        }

        match mode {
            MapMode::Read => {
                // The reply carries the range as one trailer; a range the
                // peer's parser would reject fails as an operation instead.
                if size > self.limits.max_trailing_len as u64 {
                    return (MapAsyncStatus::ValidationError, Vec::new());
                }
                let mut data = vec![0u8; size as usize];
                let Some(native) = record.native.as_ref() else {
                    return (MapAsyncStatus::ValidationError, Vec::new());
                };
                match self.backend.buffer_read(native, offset, &mut data) {
                    Ok(()) => (MapAsyncStatus::Success, data),
                    Err(err) => {
                        tracing::debug!(%err, id = buffer.id, "backend read failed");
                        (MapAsyncStatus::ValidationError, Vec::new())
                    }
                }
            }
            MapMode::Write => {
                record.write_window = Some(WriteWindow { offset, size });
                (MapAsyncStatus::Success, Vec::new())
            }
        }
    }

    fn do_buffer_update_mapped(
        &mut self,
        buffer: ObjectHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let record = self.buffers.resolve_mut(buffer)?;
        let window = record
            .write_window
            .ok_or(WireError::InvalidState { id: buffer.id })?;
        let in_window = offset >= window.offset
            && offset
                .checked_add(data.len() as u64)
                .is_some_and(|end| end <= window.offset + window.size);
        if !in_window {
            return Err(WireError::InvalidState { id: buffer.id });
        }

        // A destroyed-while-mapped buffer silently swallows the flush.
        if let Some(native) = record.native.as_mut() {
            if let Err(err) = self.backend.buffer_write(native, offset, data) {
                tracing::debug!(%err, id = buffer.id, "backend write failed");
            }
        }
        Ok(())
    }

    fn do_buffer_unmap(&mut self, buffer: ObjectHandle) -> Result<()> {
        let record = self.buffers.resolve_mut(buffer)?;
        record.write_window = None;
        Ok(())
    }

    fn do_buffer_destroy(&mut self, buffer: ObjectHandle) -> Result<()> {
        let record = self.buffers.resolve_mut(buffer)?;
        record.write_window = None;
        if let Some(native) = record.native.take() {
            self.backend.destroy_buffer(native);
        }
        Ok(())
    }

    fn do_free_objects(&mut self, kind: ObjectKind, handles: Vec<ObjectHandle>) -> Result<()> {
        tracing::trace!(?kind, count = handles.len(), "releasing retired objects");
        for handle in handles {
            match kind {
                ObjectKind::Device => {
                    self.devices.release(handle)?;
                }
                ObjectKind::Buffer => {
                    let record = self.buffers.release(handle)?;
                    if let Some(native) = record.native {
                        self.backend.destroy_buffer(native);
                    }
                }
            }
        }
        Ok(())
    }
}
