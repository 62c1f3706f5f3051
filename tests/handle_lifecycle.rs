//! Object id lifecycle across the wire: recycling, generations, destroy
//! batching, and reference validation at the server trust boundary.

use std::sync::{Arc, Mutex};

use gpu_wire::client::{BufferDescriptor, Client, ClientConfig};
use gpu_wire::command::{encode_command_into, BufferUsages, Command, RequestDeviceStatus};
use gpu_wire::events::CallbackMode;
use gpu_wire::handle::{ObjectHandle, ObjectKind};
use gpu_wire::server::{BackendError, GpuBackend, Server};
use gpu_wire::stream::Limits;
use gpu_wire::WireError;

#[derive(Default)]
struct CountingBackend {
    created: usize,
    destroyed: usize,
}

impl GpuBackend for CountingBackend {
    type Buffer = u64;

    fn request_device(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn create_buffer(&mut self, size: u64, _usage: BufferUsages) -> Result<u64, BackendError> {
        self.created += 1;
        Ok(size)
    }

    fn buffer_read(&mut self, _b: &u64, _offset: u64, out: &mut [u8]) -> Result<(), BackendError> {
        out.fill(0);
        Ok(())
    }

    fn buffer_write(&mut self, _b: &mut u64, _offset: u64, _data: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }

    fn destroy_buffer(&mut self, _buffer: u64) {
        self.destroyed += 1;
    }
}

fn pump(client: &mut Client, server: &mut Server<CountingBackend>) {
    let mut requests: Vec<Vec<u8>> = Vec::new();
    client.flush(&mut requests);
    for chunk in &requests {
        server.handle_incoming(chunk).unwrap();
    }
    let mut replies: Vec<Vec<u8>> = Vec::new();
    server.flush(&mut replies);
    for chunk in &replies {
        client.handle_incoming(chunk).unwrap();
    }
}

fn connect(client: &mut Client, server: &mut Server<CountingBackend>) -> gpu_wire::DeviceHandle {
    let seen = Arc::new(Mutex::new(None));
    let seen2 = Arc::clone(&seen);
    let (device, _) = client.request_device(CallbackMode::AllowSpontaneous, move |status| {
        *seen2.lock().unwrap() = Some(status);
    });
    pump(client, server);
    assert_eq!(*seen.lock().unwrap(), Some(RequestDeviceStatus::Success));
    device
}

fn descriptor(size: u64) -> BufferDescriptor {
    BufferDescriptor {
        size,
        usage: BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    }
}

#[test]
fn released_id_comes_back_with_bumped_generation() {
    let mut client = Client::default();
    let mut server = Server::new(CountingBackend::default(), &Limits::default());
    let device = connect(&mut client, &mut server);

    let first = client.create_buffer(device, &descriptor(16));
    assert_eq!(first.raw(), ObjectHandle::new(1, 0));

    client.release_buffer(first);
    // The id stays off-limits until the destroy batch goes out with the
    // next flush.
    assert_eq!(client.pending_destroys(ObjectKind::Buffer), 1);
    pump(&mut client, &mut server);
    assert_eq!(client.pending_destroys(ObjectKind::Buffer), 0);
    assert_eq!(server.backend().destroyed, 1);

    // Reuse prefers the lowest freed id and bumps its generation.
    let second = client.create_buffer(device, &descriptor(16));
    assert_eq!(second.raw(), ObjectHandle::new(1, 1));
    pump(&mut client, &mut server);
    assert_eq!(server.backend().created, 2);
}

#[test]
fn destroy_batch_flushes_automatically_at_threshold() {
    let mut client = Client::new(ClientConfig {
        destroy_batch_threshold: 3,
        ..ClientConfig::default()
    });
    let mut server = Server::new(CountingBackend::default(), &Limits::default());
    let device = connect(&mut client, &mut server);

    let buffers: Vec<_> = (0..4)
        .map(|_| client.create_buffer(device, &descriptor(8)))
        .collect();

    client.release_buffer(buffers[0]);
    client.release_buffer(buffers[1]);
    assert_eq!(client.pending_destroys(ObjectKind::Buffer), 2);

    // The third free crosses the threshold and goes out by itself; the
    // fourth starts a fresh batch.
    client.release_buffer(buffers[2]);
    assert_eq!(client.pending_destroys(ObjectKind::Buffer), 0);
    client.release_buffer(buffers[3]);
    assert_eq!(client.pending_destroys(ObjectKind::Buffer), 1);

    pump(&mut client, &mut server);
    assert_eq!(client.pending_destroys(ObjectKind::Buffer), 0);
    assert_eq!(server.backend().destroyed, 4);
}

#[test]
fn unknown_reference_is_fatal_to_the_connection() {
    let mut server = Server::new(CountingBackend::default(), &Limits::default());

    let mut bytes = Vec::new();
    encode_command_into(
        &Command::CreateBuffer {
            device: ObjectHandle::new(9, 0),
            result: ObjectHandle::new(1, 0),
            size: 8,
            usage: BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        },
        &mut bytes,
    );
    assert_eq!(
        server.handle_incoming(&bytes),
        Err(WireError::UnknownId { id: 9 })
    );
}

#[test]
fn stale_generation_is_fatal_to_the_connection() {
    let mut client = Client::default();
    let mut server = Server::new(CountingBackend::default(), &Limits::default());
    let device = connect(&mut client, &mut server);
    let buffer = client.create_buffer(device, &descriptor(8));
    pump(&mut client, &mut server);

    let mut bytes = Vec::new();
    encode_command_into(
        &Command::BufferDestroy {
            buffer: ObjectHandle::new(buffer.raw().id, buffer.raw().generation + 5),
        },
        &mut bytes,
    );
    assert!(matches!(
        server.handle_incoming(&bytes),
        Err(WireError::StaleReference { id: 1, .. })
    ));
}

#[test]
fn null_and_duplicate_ids_are_fatal() {
    let mut server = Server::new(CountingBackend::default(), &Limits::default());

    let mut bytes = Vec::new();
    encode_command_into(
        &Command::BufferUnmap {
            buffer: ObjectHandle::NULL,
        },
        &mut bytes,
    );
    assert_eq!(server.handle_incoming(&bytes), Err(WireError::NullReference));

    let mut server = Server::new(CountingBackend::default(), &Limits::default());
    let mut bytes = Vec::new();
    for future in [1u64, 2] {
        encode_command_into(
            &Command::RequestDevice {
                result: ObjectHandle::new(1, 0),
                future,
            },
            &mut bytes,
        );
    }
    assert_eq!(
        server.handle_incoming(&bytes),
        Err(WireError::DuplicateId { id: 1 })
    );
}
