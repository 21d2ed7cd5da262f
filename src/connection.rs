//! # Connection
//!
//! A client's identity on a bus: a numeric id unique within the bus, an
//! optional diagnostic label, the set of well-known names it currently
//! owns, an attach-mask of metadata classes it accepts on received
//! messages, and a receive pool of a fixed size. `send` is the one
//! operation that touches state beyond the connection itself — it resolves
//! a destination through the owning bus, attaches metadata capped to the
//! recipient's attach-mask, and hands the result to a transport.
//!
//! Delivery and pool management are owned by the host, not this crate;
//! [`MessageTransport`] is the contract a concrete implementation fulfills,
//! the same role `IpcTransport` plays for a concrete wire transport.
//! [`MatchDatabase`] plays the same role for the out-of-scope match/policy
//! store that `add-match`/`remove-match` forward into.

use crate::bus::Bus;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::metadata::{ConnectionMetadataSource, HostEnvironment, Metadata, MetadataClassMask, NamespaceHandle};
use crate::registry::AcquireMode;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Bit-for-bit the same vocabulary as [`MetadataClassMask`]: which classes
/// a connection is willing to receive on inbound messages.
pub type AttachMask = MetadataClassMask;

/// Where a `send` should be routed.
#[derive(Debug, Clone)]
pub enum SendTarget {
    Id(u64),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Live,
    Disconnected,
}

/// The out-of-scope payload-delivery path: receive-pool mmap and
/// kernel-to-user copy live entirely on the host side of this contract.
pub trait MessageTransport: Send + Sync {
    fn deliver(
        &self,
        sender: u64,
        recipient: u64,
        payload: &[u8],
        metadata: &[u8],
        timeout: Option<Duration>,
    ) -> Result<()>;

    fn release_pool_offset(&self, conn_id: u64, offset: u64) -> Result<()>;
}

/// The out-of-scope match/policy database that `add-match`/`remove-match`
/// forward rules into.
pub trait MatchDatabase: Send + Sync {
    fn add(&self, owner: u64, rule: &[u8]) -> Result<()>;
    fn remove(&self, owner: u64, rule: &[u8]) -> Result<()>;
}

struct Mutable {
    label: Option<String>,
    attach_mask: AttachMask,
    owned_names: Vec<String>,
    state: ConnectionState,
}

/// A live client handle on a bus. Id 0 is reserved for the broker itself
/// and is never assigned to a real connection by [`crate::bus::Bus::hello`].
pub struct Connection {
    id: u64,
    pid_ns: NamespaceHandle,
    user_ns: NamespaceHandle,
    pool_size: u64,
    endpoint: Arc<Endpoint>,
    transport: Arc<dyn MessageTransport>,
    inner: Mutex<Mutable>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        label: Option<String>,
        attach_mask: AttachMask,
        pool_size: u64,
        pid_ns: NamespaceHandle,
        user_ns: NamespaceHandle,
        endpoint: Arc<Endpoint>,
        transport: Arc<dyn MessageTransport>,
    ) -> Self {
        Self {
            id,
            pid_ns,
            user_ns,
            pool_size,
            endpoint,
            transport,
            inner: Mutex::new(Mutable {
                label,
                attach_mask,
                owned_names: Vec::new(),
                state: ConnectionState::Live,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool_size(&self) -> u64 {
        self.pool_size
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.endpoint.bus()
    }

    pub fn label(&self) -> Option<String> {
        self.inner.lock().label.clone()
    }

    pub fn attach_mask(&self) -> AttachMask {
        self.inner.lock().attach_mask
    }

    pub fn owned_names(&self) -> Vec<String> {
        self.inner.lock().owned_names.clone()
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().state == ConnectionState::Live
    }

    fn check_live(&self) -> Result<()> {
        if self.inner.lock().state != ConnectionState::Live {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    pub fn update_attach_mask(&self, mask: AttachMask) -> Result<()> {
        self.check_live()?;
        self.inner.lock().attach_mask = mask;
        Ok(())
    }

    pub fn add_match(&self, db: &dyn MatchDatabase, rule: &[u8]) -> Result<()> {
        self.check_live()?;
        db.add(self.id, rule)
    }

    pub fn remove_match(&self, db: &dyn MatchDatabase, rule: &[u8]) -> Result<()> {
        self.check_live()?;
        db.remove(self.id, rule)
    }

    /// Acquire a well-known name through the owning bus's registry.
    pub fn acquire_name(&self, name: &str, mode: AcquireMode) -> Result<()> {
        self.check_live()?;
        let bus = self.bus();
        bus.acquire_name(self, name, mode)
    }

    pub fn release_name(&self, name: &str) -> Result<()> {
        self.check_live()?;
        let bus = self.bus();
        bus.release_name(self, name)
    }

    pub(crate) fn add_owned_name(&self, name: &str) {
        let mut inner = self.inner.lock();
        if !inner.owned_names.iter().any(|n| n == name) {
            inner.owned_names.push(name.to_string());
        }
    }

    pub(crate) fn remove_owned_name(&self, name: &str) {
        self.inner.lock().owned_names.retain(|n| n != name);
    }

    /// Validate destination, resolve it via the owning bus's connection
    /// table and name registry, attach metadata capped to the recipient's
    /// attach-mask, and hand the message to the transport.
    pub fn send(
        &self,
        target: SendTarget,
        payload: &[u8],
        requested: MetadataClassMask,
        host: &dyn HostEnvironment,
        sequence: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.check_live()?;
        let bus = self.bus();
        let recipient = bus.resolve_destination(&target)?;

        let mask = requested & recipient.attach_mask();
        let mut metadata = Metadata::new(self.pid_ns, self.user_ns);
        metadata.collect(mask, host, self, sequence)?;

        self.transport
            .deliver(self.id, recipient.id(), payload, metadata.as_bytes(), timeout)
    }

    pub fn free_pool_offset(&self, offset: u64) -> Result<()> {
        self.transport.release_pool_offset(self.id, offset)
    }

    /// Mark disconnected. Idempotent; does not by itself unlink the
    /// connection from the owning bus's table or release its names — the
    /// bus drives that as part of tearing the connection down.
    pub(crate) fn mark_disconnected(&self) {
        self.inner.lock().state = ConnectionState::Disconnected;
    }
}

impl ConnectionMetadataSource for Connection {
    fn owned_names(&self) -> Vec<(String, u64)> {
        self.inner
            .lock()
            .owned_names
            .iter()
            .map(|n| (n.clone(), 0u64))
            .collect()
    }

    fn label(&self) -> Option<String> {
        self.inner.lock().label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::endpoint::{AccessMode, Endpoint};
    use crate::metadata::test_support::MockHostEnvironment;
    use crate::namespace::Namespace;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        delivered: StdMutex<Vec<(u64, u64, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: StdMutex::new(Vec::new()),
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
        ) -> Result<()> {
            self.delivered
                .lock()
                .unwrap()
                .push((sender, recipient, payload.to_vec()));
            Ok(())
        }

        fn release_pool_offset(&self, _conn_id: u64, _offset: u64) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (Arc<Bus>, Arc<RecordingTransport>) {
        let ns = Namespace::new_root();
        let transport = RecordingTransport::new();
        let bus = ns
            .make_bus(
                "1000-testbus",
                1000,
                64,
                None,
                crate::bus::BusFlags::empty(),
                transport.clone(),
            )
            .unwrap();
        (bus, transport)
    }

    fn hello(bus: &Arc<Bus>, label: &str) -> Arc<Connection> {
        let endpoint = bus.default_endpoint();
        bus.hello(
            &endpoint,
            Some(label.to_string()),
            AttachMask::empty(),
            4096,
            NamespaceHandle(1),
            NamespaceHandle(1),
        )
        .unwrap()
    }

    #[test]
    fn ids_start_at_one_and_are_unique() {
        let (bus, _t) = setup();
        let a = hello(&bus, "a");
        let b = hello(&bus, "b");
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
    }

    #[test]
    fn send_by_id_delivers_intersected_metadata() {
        let (bus, transport) = setup();
        let sender = hello(&bus, "sender");
        let recipient = hello(&bus, "recipient");
        recipient
            .update_attach_mask(AttachMask::TIMESTAMP)
            .unwrap();

        let host = MockHostEnvironment::default();
        sender
            .send(
                SendTarget::Id(recipient.id()),
                b"hi",
                AttachMask::TIMESTAMP | AttachMask::CREDS,
                &host,
                0,
                None,
            )
            .unwrap();

        let delivered = transport.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, sender.id());
        assert_eq!(delivered[0].1, recipient.id());
        assert_eq!(delivered[0].2, b"hi");
    }

    #[test]
    fn send_to_unknown_id_fails() {
        let (bus, _t) = setup();
        let sender = hello(&bus, "sender");
        let host = MockHostEnvironment::default();
        let err = sender
            .send(SendTarget::Id(999), b"hi", AttachMask::empty(), &host, 0, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn disconnected_connection_rejects_further_operations() {
        let (bus, _t) = setup();
        let conn = hello(&bus, "c");
        conn.mark_disconnected();
        let err = conn.update_attach_mask(AttachMask::empty()).unwrap_err();
        assert_eq!(err, Error::Shutdown);
    }

    #[test]
    fn acquiring_and_releasing_a_name_updates_owned_names() {
        let (bus, _t) = setup();
        let conn = hello(&bus, "c");
        conn.acquire_name("1000-foo", AcquireMode::FailIfTaken).unwrap();
        assert_eq!(conn.owned_names(), vec!["1000-foo".to_string()]);
        conn.release_name("1000-foo").unwrap();
        assert!(conn.owned_names().is_empty());
    }
}
