//! Client/server wire protocol for driving a GPU-style API across an
//! ordered, reliable byte stream.
//!
//! The client pre-allocates object ids so API calls return usable handles
//! without waiting for the server, speaks a tagged little-endian command
//! stream ([`command`], [`stream`]), tracks asynchronous completions through
//! a future table with exactly-once callbacks ([`events`]), and shuttles
//! mapped-buffer bytes through staging copies ([`client`]). The server
//! mirrors the tables at client-chosen ids, generation-checks every incoming
//! reference, and drives a pluggable synchronous backend ([`server`]).
//!
//! ```
//! use gpu_wire::client::{BufferDescriptor, Client};
//! use gpu_wire::command::BufferUsages;
//! use gpu_wire::events::CallbackMode;
//! use gpu_wire::command::RequestDeviceStatus;
//!
//! let mut client = Client::default();
//! let (device, _) = client.request_device(CallbackMode::AllowSpontaneous, |status| {
//!     assert_eq!(status, RequestDeviceStatus::Shutdown); // resolved by disconnect below
//! });
//! let buffer = client.create_buffer(
//!     device,
//!     &BufferDescriptor {
//!         size: 256,
//!         usage: BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC,
//!         mapped_at_creation: true,
//!     },
//! );
//! client
//!     .buffer_get_mapped_range_mut(buffer, 0, 256)
//!     .unwrap()
//!     .fill(0x2A);
//! client.buffer_unmap(buffer);
//!
//! let mut chunks: Vec<Vec<u8>> = Vec::new();
//! client.flush(&mut chunks); // feed these to a Server
//! client.disconnect();
//! ```

#![forbid(unsafe_code)]

pub mod client;
pub mod command;
pub mod error;
pub mod events;
pub mod handle;
pub mod server;
pub mod stream;
pub mod table;

pub use client::{BufferDescriptor, BufferHandle, Client, ClientConfig, DeviceHandle};
pub use command::{BufferUsages, MapAsyncStatus, MapMode, RequestDeviceStatus, WHOLE_SIZE};
pub use error::{Result, WireError};
pub use events::{CallbackMode, FutureWaitInfo, WaitStatus};
pub use handle::{FutureId, ObjectHandle, ObjectKind};
pub use server::{BackendError, GpuBackend, Server};
pub use stream::Limits;
