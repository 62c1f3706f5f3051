//! Client endpoint: the consumer-side half of the wire.
//!
//! The client owns the authoritative id allocators. API calls allocate their
//! result handles locally at call time, stage commands on the writer, and
//! register futures with the event manager; replies arriving through
//! [`Client::handle_incoming`] resolve those futures. All local rejections
//! (map already pending, buffer destroyed, bad range) complete the callback
//! through the event manager without a round trip.

use crate::command::{
    decode_return, encode_command_into, BufferUsages, Command, MapAsyncStatus, MapMode,
    RequestDeviceStatus, ReturnCommand, MAP_OFFSET_ALIGNMENT, MAP_SIZE_ALIGNMENT, WHOLE_SIZE,
};
use crate::error::{Result, WireError};
use crate::events::{
    CallbackMode, EventCallback, EventCompletion, EventManager, FutureWaitInfo, WaitStatus,
};
use crate::handle::{FutureId, ObjectHandle, ObjectKind};
use crate::stream::{CommandSink, CommandWriter, Limits, WireParser};
use crate::table::ObjectTable;

use std::collections::HashMap;

/// Default number of freed objects that forces an automatic destroy-batch
/// flush.
pub const DEFAULT_DESTROY_BATCH_THRESHOLD: usize = 16;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub limits: Limits,
    /// Freeing this many objects of one kind without an intervening flush
    /// forces the batch onto the wire, bounding the staleness window.
    pub destroy_batch_threshold: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            destroy_batch_threshold: DEFAULT_DESTROY_BATCH_THRESHOLD,
        }
    }
}

/// Client-side reference to a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(ObjectHandle);

/// Client-side reference to a remote buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle(ObjectHandle);

impl DeviceHandle {
    pub fn raw(&self) -> ObjectHandle {
        self.0
    }
}

impl BufferHandle {
    pub fn raw(&self) -> ObjectHandle {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsages,
    pub mapped_at_creation: bool,
}

/// Externally observable mapping state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMapState {
    Unmapped,
    /// A map request is in flight.
    Pending,
    Mapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum MapState {
    #[default]
    Unmapped,
    MappedForRead,
    MappedForWrite,
    MappedAtCreation,
}

impl MapState {
    fn writable(self) -> bool {
        matches!(self, MapState::MappedForWrite | MapState::MappedAtCreation)
    }

    fn mapped(self) -> bool {
        !matches!(self, MapState::Unmapped)
    }
}

/// In-flight map request; at most one per buffer.
#[derive(Debug, Clone, Copy)]
struct MapRequest {
    future: FutureId,
    offset: u64,
    size: u64,
    mode: MapMode,
}

#[derive(Debug, Default)]
struct MapStateData {
    state: MapState,
    pending: Option<MapRequest>,
    /// Staging copy of the mapped bytes, shuttled across the wire. Present
    /// for mappable buffers only; this is the transfer handle.
    staging: Option<Vec<u8>>,
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct BufferRecord {
    size: u64,
    usage: BufferUsages,
    destroyed: bool,
    map: MapStateData,
}

#[derive(Debug)]
struct DeviceRecord {
    lost: bool,
}

pub struct Client {
    config: ClientConfig,
    connected: bool,
    devices: ObjectTable<DeviceRecord>,
    buffers: ObjectTable<BufferRecord>,
    events: EventManager,
    /// future id → device the request will resolve, so a failure can mark
    /// the pre-allocated record defunct.
    pending_device_requests: HashMap<FutureId, ObjectHandle>,
    writer: CommandWriter,
    parser: WireParser,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            connected: true,
            devices: ObjectTable::new(),
            buffers: ObjectTable::new(),
            events: EventManager::new(),
            pending_device_requests: HashMap::new(),
            writer: CommandWriter::new(&config.limits),
            parser: WireParser::new(&config.limits),
            config,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn serialize(&mut self, cmd: &Command) {
        if !self.connected {
            return;
        }
        self.writer.push_encoded(|out| encode_command_into(cmd, out));
    }

    /// Asks the server to create a device. The handle is usable by later
    /// commands on the same stream immediately; the callback reports whether
    /// the server actually backed it.
    pub fn request_device(
        &mut self,
        mode: CallbackMode,
        callback: impl FnOnce(RequestDeviceStatus) + Send + 'static,
    ) -> (DeviceHandle, FutureId) {
        let result = self.devices.allocate(DeviceRecord { lost: false });
        let future = self
            .events
            .track(mode, EventCallback::RequestDevice(Box::new(callback)));
        if self.connected {
            self.pending_device_requests.insert(future, result);
            self.serialize(&Command::RequestDevice { result, future });
        }
        (DeviceHandle(result), future)
    }

    /// Creates a buffer. The result handle is pre-allocated so later
    /// commands in the same stream may reference it; the server mirrors the
    /// record even if its own allocation fails.
    pub fn create_buffer(&mut self, device: DeviceHandle, desc: &BufferDescriptor) -> BufferHandle {
        let mappable = desc
            .usage
            .intersects(BufferUsages::MAP_READ | BufferUsages::MAP_WRITE)
            || desc.mapped_at_creation;

        let mut map = MapStateData::default();
        if mappable {
            map.staging = Some(vec![0u8; desc.size as usize]);
        }
        if desc.mapped_at_creation {
            map.state = MapState::MappedAtCreation;
            map.offset = 0;
            map.size = desc.size;
        }

        let result = self.buffers.allocate(BufferRecord {
            size: desc.size,
            usage: desc.usage,
            destroyed: false,
            map,
        });
        self.serialize(&Command::CreateBuffer {
            device: device.0,
            result,
            size: desc.size,
            usage: desc.usage,
            mapped_at_creation: desc.mapped_at_creation,
        });
        BufferHandle(result)
    }

    /// Requests an asynchronous mapping of `[offset, offset + size)`.
    /// `size == WHOLE_SIZE` resolves to the rest of the buffer. Local
    /// rejections complete the future without a round trip, each with its
    /// own status.
    pub fn buffer_map_async(
        &mut self,
        buffer: BufferHandle,
        mode: MapMode,
        offset: u64,
        size: u64,
        cb_mode: CallbackMode,
        callback: impl FnOnce(MapAsyncStatus) + Send + 'static,
    ) -> FutureId {
        let future = self
            .events
            .track(cb_mode, EventCallback::MapAsync(Box::new(callback)));
        if !self.connected {
            // track() already completed the callback with DeviceLost.
            return future;
        }

        let Ok(record) = self.buffers.resolve_mut(buffer.0) else {
            // Unknown or released handle; distinct from a live record whose
            // backing was destroyed.
            self.events
                .set_ready(future, EventCompletion::MapAsync(MapAsyncStatus::ValidationError));
            return future;
        };

        if record.map.pending.is_some() {
            self.events.set_ready(
                future,
                EventCompletion::MapAsync(MapAsyncStatus::MappingAlreadyPending),
            );
            return future;
        }
        if record.destroyed {
            self.events.set_ready(
                future,
                EventCompletion::MapAsync(MapAsyncStatus::DestroyedBeforeCallback),
            );
            return future;
        }

        let size = if size == WHOLE_SIZE && offset <= record.size {
            record.size - offset
        } else {
            size
        };

        let usage_ok = match mode {
            MapMode::Read => record.usage.contains(BufferUsages::MAP_READ),
            MapMode::Write => record.usage.contains(BufferUsages::MAP_WRITE),
        };
        let state_ok = record.map.state == MapState::Unmapped;
        let range_ok = offset
            .checked_add(size)
            .is_some_and(|end| end <= record.size);
        let aligned = offset % MAP_OFFSET_ALIGNMENT == 0 && size % MAP_SIZE_ALIGNMENT == 0;
        // A read reply carries the whole range in one command, so it must
        // fit the peer's trailer limit. Write flushes are split on unmap and
        // have no such bound.
        let transfer_ok = match mode {
            MapMode::Read => size <= self.config.limits.max_trailing_len as u64,
            MapMode::Write => true,
        };
        if !(usage_ok && state_ok && range_ok && aligned && transfer_ok) {
            self.events.set_ready(
                future,
                EventCompletion::MapAsync(MapAsyncStatus::ValidationError),
            );
            return future;
        }

        record.map.pending = Some(MapRequest {
            future,
            offset,
            size,
            mode,
        });
        self.serialize(&Command::BufferMapAsync {
            buffer: buffer.0,
            future,
            mode,
            offset,
            size,
        });
        future
    }

    /// Read access to the mapped bytes. `size == WHOLE_SIZE` takes the rest
    /// of the buffer. The range must sit inside the currently mapped
    /// sub-range with the platform alignment rules.
    pub fn buffer_get_mapped_range(
        &self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> Option<&[u8]> {
        let record = self.buffers.resolve(buffer.0).ok()?;
        if !record.map.state.mapped() {
            return None;
        }
        let size = Self::mapped_range(record, offset, size)?;
        let staging = record.map.staging.as_ref()?;
        Some(&staging[offset as usize..(offset + size) as usize])
    }

    /// Write access to the mapped bytes; requires a write mapping.
    pub fn buffer_get_mapped_range_mut(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> Option<&mut [u8]> {
        let record = self.buffers.resolve_mut(buffer.0).ok()?;
        if !record.map.state.writable() {
            return None;
        }
        let size = Self::mapped_range(record, offset, size)?;
        let staging = record.map.staging.as_mut()?;
        Some(&mut staging[offset as usize..(offset + size) as usize])
    }

    fn mapped_range(record: &BufferRecord, offset: u64, size: u64) -> Option<u64> {
        if offset % MAP_OFFSET_ALIGNMENT != 0 || offset > record.size {
            return None;
        }
        let size = if size == WHOLE_SIZE {
            record.size - offset
        } else {
            size
        };
        if size % MAP_SIZE_ALIGNMENT != 0 {
            return None;
        }
        let end = offset.checked_add(size)?;
        let map = &record.map;
        if offset < map.offset || end > map.offset + map.size {
            return None;
        }
        Some(size)
    }

    /// Unmaps the buffer. A still-pending map request resolves with
    /// `UnmappedBeforeCallback` before anything else; a write mapping
    /// flushes its staged bytes, covering exactly the mapped window, ahead
    /// of the unmap so in-flight readers observe them. A window larger than
    /// the trailer limit goes out as several update commands so the flush
    /// never produces an un-parseable trailer.
    pub fn buffer_unmap(&mut self, buffer: BufferHandle) {
        let Ok(record) = self.buffers.resolve_mut(buffer.0) else {
            return;
        };

        if let Some(pending) = record.map.pending.take() {
            self.events.set_ready(
                pending.future,
                EventCompletion::MapAsync(MapAsyncStatus::UnmappedBeforeCallback),
            );
        }

        let mut flush: Vec<(u64, Vec<u8>)> = Vec::new();
        if record.map.state.writable() {
            if let Some(staging) = record.map.staging.as_ref() {
                let max = self.config.limits.max_trailing_len.max(1);
                let end = (record.map.offset + record.map.size) as usize;
                let mut off = record.map.offset as usize;
                while off < end {
                    let take = (end - off).min(max);
                    flush.push((off as u64, staging[off..off + take].to_vec()));
                    off += take;
                }
            }
        }
        record.map.state = MapState::Unmapped;
        record.map.offset = 0;
        record.map.size = 0;

        for (offset, data) in flush {
            self.serialize(&Command::BufferUpdateMappedData {
                buffer: buffer.0,
                offset,
                data,
            });
        }
        self.serialize(&Command::BufferUnmap { buffer: buffer.0 });
    }

    /// Destroys the buffer's backing. Reachable from any state; a pending
    /// map request resolves with `DestroyedBeforeCallback` first, and the
    /// staging allocation is dropped so no stale pointer survives.
    pub fn buffer_destroy(&mut self, buffer: BufferHandle) {
        let Ok(record) = self.buffers.resolve_mut(buffer.0) else {
            return;
        };

        if let Some(pending) = record.map.pending.take() {
            self.events.set_ready(
                pending.future,
                EventCompletion::MapAsync(MapAsyncStatus::DestroyedBeforeCallback),
            );
        }

        record.destroyed = true;
        record.map.state = MapState::Unmapped;
        record.map.staging = None;
        record.map.offset = 0;
        record.map.size = 0;

        self.serialize(&Command::BufferDestroy { buffer: buffer.0 });
    }

    /// Retires the handle: the record is freed locally and the id joins the
    /// next destroy batch. A batch reaching the configured threshold is
    /// flushed automatically.
    pub fn release_buffer(&mut self, buffer: BufferHandle) {
        let Ok(record) = self.buffers.resolve_mut(buffer.0) else {
            return;
        };
        if let Some(pending) = record.map.pending.take() {
            self.events.set_ready(
                pending.future,
                EventCompletion::MapAsync(MapAsyncStatus::DestroyedBeforeCallback),
            );
        }
        let _ = self.buffers.free(buffer.0);
        if self.buffers.pending_destroy_len() >= self.config.destroy_batch_threshold {
            self.flush_destroy_batch(ObjectKind::Buffer);
        }
    }

    /// Retires a device handle into the destroy batch.
    pub fn release_device(&mut self, device: DeviceHandle) {
        if self.devices.free(device.0).is_err() {
            return;
        }
        if self.devices.pending_destroy_len() >= self.config.destroy_batch_threshold {
            self.flush_destroy_batch(ObjectKind::Device);
        }
    }

    fn flush_destroy_batch(&mut self, kind: ObjectKind) {
        let handles = match kind {
            ObjectKind::Device => self.devices.take_destroy_batch(),
            ObjectKind::Buffer => self.buffers.take_destroy_batch(),
        };
        if handles.is_empty() {
            return;
        }
        tracing::debug!(?kind, count = handles.len(), "flushing destroy batch");
        self.serialize(&Command::FreeObjects { kind, handles });
    }

    /// Number of frees of this kind waiting for the next batch flush.
    pub fn pending_destroys(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Device => self.devices.pending_destroy_len(),
            ObjectKind::Buffer => self.buffers.pending_destroy_len(),
        }
    }

    /// Whether the device is unusable: the server refused to back it, or the
    /// connection is gone.
    pub fn device_lost(&self, device: DeviceHandle) -> Option<bool> {
        let record = self.devices.resolve(device.0).ok()?;
        Some(record.lost || !self.connected)
    }

    /// Current mapping state as the application observes it.
    pub fn buffer_map_state(&self, buffer: BufferHandle) -> Option<BufferMapState> {
        let record = self.buffers.resolve(buffer.0).ok()?;
        Some(if record.map.state.mapped() {
            BufferMapState::Mapped
        } else if record.map.pending.is_some() {
            BufferMapState::Pending
        } else {
            BufferMapState::Unmapped
        })
    }

    pub fn process_events(&self) {
        self.events.process_events();
    }

    pub fn wait_any(&self, infos: &mut [FutureWaitInfo], timeout_ns: u64) -> WaitStatus {
        self.events.wait_any(infos, timeout_ns)
    }

    /// Drains staged commands (and any queued destroy batches) to the
    /// transport in chunks no larger than the configured write size.
    pub fn flush(&mut self, sink: &mut dyn CommandSink) {
        self.flush_destroy_batch(ObjectKind::Buffer);
        self.flush_destroy_batch(ObjectKind::Device);
        self.writer.flush(sink);
    }

    /// Processes server→client bytes. Chunk boundaries are arbitrary. A
    /// fatal [`WireError`] means the stream is poisoned and the caller must
    /// disconnect.
    pub fn handle_incoming(&mut self, chunk: &[u8]) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        let frames = self.parser.push(chunk)?;
        for frame in frames {
            let ret = decode_return(frame.tag, &frame.fixed, &frame.trailing)?;
            tracing::trace!(tag = frame.tag, "client processing reply");
            self.process_return(ret)?;
        }
        Ok(())
    }

    fn process_return(&mut self, ret: ReturnCommand) -> Result<()> {
        match ret {
            ReturnCommand::RequestDevice { future, status } => {
                if let Some(device) = self.pending_device_requests.remove(&future) {
                    if status != RequestDeviceStatus::Success {
                        if let Some(record) = self.devices.get_mut(device.id) {
                            record.lost = true;
                        }
                    }
                }
                self.events
                    .set_ready(future, EventCompletion::RequestDevice(status));
            }
            ReturnCommand::BufferMapAsync {
                buffer,
                future,
                status,
                data,
            } => {
                let Ok(record) = self.buffers.resolve_mut(buffer) else {
                    // The buffer was released while the reply was in flight.
                    tracing::trace!(id = buffer.id, "dropping map reply for retired buffer");
                    return Ok(());
                };
                let Some(pending) = record.map.pending.filter(|p| p.future == future) else {
                    // Superseded by a local unmap/destroy; the callback
                    // already fired with the cancellation status.
                    tracing::trace!(id = buffer.id, future, "dropping stale map reply");
                    return Ok(());
                };
                record.map.pending = None;

                if status == MapAsyncStatus::Success {
                    match pending.mode {
                        MapMode::Read => {
                            if data.len() as u64 != pending.size {
                                return Err(WireError::TrailerLengthMismatch {
                                    tag: crate::command::RET_BUFFER_MAP_ASYNC,
                                    expected: pending.size as usize,
                                    got: data.len(),
                                });
                            }
                            let staging = record
                                .map
                                .staging
                                .as_mut()
                                .ok_or(WireError::UnexpectedReply { id: buffer.id })?;
                            let start = pending.offset as usize;
                            staging[start..start + data.len()].copy_from_slice(&data);
                            record.map.state = MapState::MappedForRead;
                        }
                        MapMode::Write => {
                            record.map.state = MapState::MappedForWrite;
                        }
                    }
                    record.map.offset = pending.offset;
                    record.map.size = pending.size;
                }
                self.events
                    .set_ready(future, EventCompletion::MapAsync(status));
            }
        }
        Ok(())
    }

    /// Universal cancellation: resolves every outstanding future with the
    /// shutdown status and stops producing or accepting wire traffic.
    /// Idempotent.
    pub fn disconnect(&mut self) {
        if !self.connected {
            // A second disconnect must not fire anything new.
            self.events.shutdown();
            return;
        }
        self.connected = false;
        self.pending_device_requests.clear();
        // Pending map requests resolve through the event table below; the
        // records go away together with their staging memory.
        self.buffers.drain_live();
        self.devices.drain_live();
        tracing::debug!("client disconnecting");
        self.events.shutdown();
    }
}
