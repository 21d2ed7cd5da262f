//! End-to-end coverage of the object graph: decode a make-namespace and a
//! make-bus command exactly as a host dispatcher would hand them in,
//! apply both, then drive hello / acquire-name / send / disconnect
//! through the resulting bus.

use kdbus_broker_core::command::{self, MAKE_BUS_HEADER_SIZE, MAKE_NAMESPACE_HEADER_SIZE};
use kdbus_broker_core::connection::{AttachMask, MessageTransport, SendTarget};
use kdbus_broker_core::error::Error;
use kdbus_broker_core::item::ItemBuilder;
use kdbus_broker_core::metadata::NamespaceHandle;
use kdbus_broker_core::namespace::Subsystem;
use kdbus_broker_core::registry::AcquireMode;
use kdbus_broker_core::types::ItemType;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingTransport {
    delivered: Mutex<Vec<(u64, u64, Vec<u8>)>>,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
        })
    }
}

impl MessageTransport for RecordingTransport {
    fn deliver(
        &self,
        sender: u64,
        recipient: u64,
        payload: &[u8],
        _metadata: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.delivered
            .lock()
            .unwrap()
            .push((sender, recipient, payload.to_vec()));
        Ok(())
    }

    fn release_pool_offset(&self, _conn_id: u64, _offset: u64) -> Result<(), Error> {
        Ok(())
    }
}

fn encode_make_namespace(name: &str) -> Vec<u8> {
    let mut items = ItemBuilder::new();
    let mut payload = name.as_bytes().to_vec();
    payload.push(0);
    items.push_item(ItemType::MakeName.code(), &payload).unwrap();
    let item_bytes = items.finish();

    let mut buf = Vec::new();
    let total = (MAKE_NAMESPACE_HEADER_SIZE + item_bytes.len()) as u64;
    buf.extend_from_slice(&total.to_le_bytes());
    buf.extend_from_slice(&item_bytes);
    buf
}

fn encode_make_bus(name: &str, bloom_size: u32, cgroup_id: Option<u64>) -> Vec<u8> {
    let mut items = ItemBuilder::new();
    let mut payload = name.as_bytes().to_vec();
    payload.push(0);
    items.push_item(ItemType::MakeName.code(), &payload).unwrap();
    if let Some(cg) = cgroup_id {
        items.push_item(ItemType::MakeCgroup.code(), &cg.to_le_bytes()).unwrap();
    }
    let item_bytes = items.finish();

    let mut buf = Vec::new();
    let total = (MAKE_BUS_HEADER_SIZE + item_bytes.len()) as u64;
    buf.extend_from_slice(&total.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&(bloom_size as u64).to_le_bytes());
    buf.extend_from_slice(&item_bytes);
    buf
}

#[test]
fn full_lifecycle_make_namespace_make_bus_hello_acquire_send_disconnect() {
    let subsystem = Subsystem::new();
    let root = subsystem.root();

    let ns_cmd = command::decode_make_namespace(&encode_make_namespace("testns")).unwrap();
    let namespace = subsystem.make_namespace_from_command(&root, &ns_cmd).unwrap();
    assert_eq!(namespace.devpath(), "kdbus/ns/testns");

    let bus_cmd = command::decode_make_bus(&encode_make_bus("1000-svc", 64, Some(42))).unwrap();
    let transport = RecordingTransport::new();
    let bus = namespace
        .make_bus_from_command(&bus_cmd, 1000, transport.clone())
        .unwrap();
    assert_eq!(bus.cgroup_id(), Some(42));

    let endpoint = bus.default_endpoint();
    let server = bus
        .hello(
            &endpoint,
            Some("server".to_string()),
            AttachMask::empty(),
            4096,
            NamespaceHandle(1),
            NamespaceHandle(1),
        )
        .unwrap();
    let client = bus
        .hello(
            &endpoint,
            Some("client".to_string()),
            AttachMask::empty(),
            4096,
            NamespaceHandle(1),
            NamespaceHandle(1),
        )
        .unwrap();
    assert_eq!(server.id(), 1);
    assert_eq!(client.id(), 2);

    server.acquire_name("1000-greeter", AcquireMode::FailIfTaken).unwrap();

    client
        .send(
            SendTarget::Name("1000-greeter".to_string()),
            b"ping",
            AttachMask::empty(),
            &kdbus_broker_core::metadata::test_support::MockHostEnvironment::default(),
            1,
            None,
        )
        .unwrap();

    let delivered = transport.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0], (client.id(), server.id(), b"ping".to_vec()));
    drop(delivered);

    bus.disconnect_connection(server.id());
    assert!(bus.list_names().is_empty());
    let err = client
        .send(
            SendTarget::Id(server.id()),
            b"ping again",
            AttachMask::empty(),
            &kdbus_broker_core::metadata::test_support::MockHostEnvironment::default(),
            2,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn bus_make_rejects_missing_uid_prefix_and_bad_bloom_size() {
    let subsystem = Subsystem::new();
    let root = subsystem.root();

    let bad_prefix = command::decode_make_bus(&encode_make_bus("nobody", 64, None)).unwrap();
    let err = root.make_bus_from_command(&bad_prefix, 1000, RecordingTransport::new()).unwrap_err();
    assert_eq!(err, Error::PermissionDenied);

    let bad_bloom = command::decode_make_bus(&encode_make_bus("1000-bad", 7, None)).unwrap();
    let err = root.make_bus_from_command(&bad_bloom, 1000, RecordingTransport::new()).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn remaking_the_same_bus_name_returns_already_exists() {
    let subsystem = Subsystem::new();
    let root = subsystem.root();
    let cmd = command::decode_make_bus(&encode_make_bus("1000-dup", 64, None)).unwrap();
    root.make_bus_from_command(&cmd, 1000, RecordingTransport::new()).unwrap();
    let err = root.make_bus_from_command(&cmd, 1000, RecordingTransport::new()).unwrap_err();
    assert_eq!(err, Error::AlreadyExists);
}

#[test]
fn metadata_collected_on_send_is_idempotent_across_retries() {
    let subsystem = Subsystem::new();
    let root = subsystem.root();
    let cmd = command::decode_make_bus(&encode_make_bus("1000-md", 64, None)).unwrap();
    let transport = RecordingTransport::new();
    let bus = root.make_bus_from_command(&cmd, 1000, transport.clone()).unwrap();
    let endpoint = bus.default_endpoint();

    let conn = bus
        .hello(
            &endpoint,
            None,
            AttachMask::TIMESTAMP | AttachMask::CREDS,
            4096,
            NamespaceHandle(7),
            NamespaceHandle(7),
        )
        .unwrap();
    conn.acquire_name("1000-self", AcquireMode::FailIfTaken).unwrap();

    let host = kdbus_broker_core::metadata::test_support::MockHostEnvironment::default();
    conn.send(
        SendTarget::Name("1000-self".to_string()),
        b"x",
        AttachMask::TIMESTAMP | AttachMask::CREDS,
        &host,
        1,
        None,
    )
    .unwrap();
    conn.send(
        SendTarget::Name("1000-self".to_string()),
        b"y",
        AttachMask::TIMESTAMP | AttachMask::CREDS,
        &host,
        2,
        None,
    )
    .unwrap();

    assert_eq!(transport.delivered.lock().unwrap().len(), 2);
}
