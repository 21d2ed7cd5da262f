//! # Bus
//!
//! A named domain of discourse within a namespace: a connection-id
//! counter, a connection table keyed by id, a set of endpoints (the
//! default one named `"bus"` plus any extra access points), and a name
//! registry. Bus creation enforces the `"<uid>-"` name-prefix rule and
//! `bloom_size` bounds; both are checked here rather than in the
//! namespace, since they're facts about the bus being made, not about its
//! parent's child list.

use crate::connection::{Connection, MessageTransport, SendTarget};
use crate::endpoint::{AccessMode, Endpoint};
use crate::error::{Error, Result};
use crate::metadata::NamespaceHandle;
use crate::namespace::Namespace;
use crate::registry::{AcquireMode, NameRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use crate::defaults::{MAX_BLOOM_SIZE, MIN_BLOOM_SIZE};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusFlags: u64 {
        /// Grant world access on the default endpoint, in addition to the
        /// owner uid and owning gid that are always allowed. Absent this
        /// bit the default endpoint is mode 0660 (owner + group only).
        const ACCESS_WORLD = 1 << 0;
        /// The default endpoint (and any endpoint inheriting bus flags)
        /// bypasses its access-mode check entirely.
        const POLICY_OPEN = 1 << 1;
    }
}

/// Check that `name` begins with `"<uid>-"`, comparing the full prefix
/// string rather than a length derived from a boolean expression.
pub fn validate_name_prefix(name: &str, uid: u32) -> Result<()> {
    let prefix = format!("{uid}-");
    if name.starts_with(&prefix) {
        Ok(())
    } else {
        Err(Error::PermissionDenied)
    }
}

/// Check `bloom_size` is within `[MIN_BLOOM_SIZE, MAX_BLOOM_SIZE]` and a
/// multiple of 8. Every violation is `Error::InvalidArgument`, including
/// the misalignment case a host ABI might otherwise report differently.
pub fn validate_bloom_size(bloom_size: u32) -> Result<()> {
    if bloom_size < MIN_BLOOM_SIZE || bloom_size > MAX_BLOOM_SIZE {
        return Err(Error::InvalidArgument(format!(
            "bloom_size {bloom_size} out of range [{MIN_BLOOM_SIZE}, {MAX_BLOOM_SIZE}]"
        )));
    }
    if bloom_size % 8 != 0 {
        return Err(Error::InvalidArgument(format!(
            "bloom_size {bloom_size} is not a multiple of 8"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusState {
    Live,
    Disconnected,
}

struct Mutable {
    state: BusState,
    endpoints: Vec<Arc<Endpoint>>,
    connections: HashMap<u64, Arc<Connection>>,
}

/// A bus and everything it directly owns: endpoints, connections, and a
/// name registry.
pub struct Bus {
    id: u64,
    name: String,
    flags: BusFlags,
    bloom_size: u32,
    cgroup_id: Option<u64>,
    owner_uid: u32,
    namespace: Arc<Namespace>,
    transport: Arc<dyn MessageTransport>,
    conn_id_counter: AtomicU64,
    inner: Mutex<Mutable>,
    registry: Mutex<NameRegistry>,
}

impl Bus {
    pub(crate) fn construct(
        id: u64,
        name: String,
        owner_uid: u32,
        owner_gid: u32,
        bloom_size: u32,
        cgroup_id: Option<u64>,
        flags: BusFlags,
        namespace: Arc<Namespace>,
        transport: Arc<dyn MessageTransport>,
    ) -> Result<Arc<Self>> {
        validate_name_prefix(&name, owner_uid)?;
        validate_bloom_size(bloom_size)?;

        let bus = Arc::new(Self {
            id,
            name,
            flags,
            bloom_size,
            cgroup_id,
            owner_uid,
            namespace,
            transport,
            conn_id_counter: AtomicU64::new(1),
            inner: Mutex::new(Mutable {
                state: BusState::Live,
                endpoints: Vec::new(),
                connections: HashMap::new(),
            }),
            registry: Mutex::new(NameRegistry::new()),
        });

        let mut default_mode = AccessMode::OWNER | AccessMode::GROUP;
        if bus.flags.contains(BusFlags::ACCESS_WORLD) {
            default_mode |= AccessMode::WORLD;
        }
        let default_endpoint = Endpoint::new(
            "bus".to_string(),
            default_mode,
            owner_uid,
            owner_gid,
            bus.flags.contains(BusFlags::POLICY_OPEN),
            bus.clone(),
        );
        bus.inner.lock().endpoints.push(default_endpoint);

        Ok(bus)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bloom_size(&self) -> u32 {
        self.bloom_size
    }

    pub fn cgroup_id(&self) -> Option<u64> {
        self.cgroup_id
    }

    pub fn owner_uid(&self) -> u32 {
        self.owner_uid
    }

    pub fn namespace(&self) -> Arc<Namespace> {
        self.namespace.clone()
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().state == BusState::Live
    }

    pub fn default_endpoint(&self) -> Arc<Endpoint> {
        self.inner.lock().endpoints[0].clone()
    }

    pub fn make_endpoint(
        self: &Arc<Self>,
        name: &str,
        mode: AccessMode,
        uid: u32,
        gid: u32,
        policy_open: bool,
    ) -> Result<Arc<Endpoint>> {
        let mut inner = self.inner.lock();
        if inner.state != BusState::Live {
            return Err(Error::Shutdown);
        }
        if inner.endpoints.iter().any(|e| e.name() == name) {
            return Err(Error::AlreadyExists);
        }
        let endpoint = Endpoint::new(name.to_string(), mode, uid, gid, policy_open, self.clone());
        inner.endpoints.push(endpoint.clone());
        Ok(endpoint)
    }

    /// Bind a new connection to this bus through `endpoint`. Callers must
    /// have already checked `endpoint.check_access` against the caller's
    /// credentials; those credentials arrive through the host file handle,
    /// out of scope here.
    pub fn hello(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        label: Option<String>,
        attach_mask: crate::connection::AttachMask,
        pool_size: u64,
        pid_ns: NamespaceHandle,
        user_ns: NamespaceHandle,
    ) -> Result<Arc<Connection>> {
        let mut inner = self.inner.lock();
        if inner.state != BusState::Live {
            return Err(Error::Shutdown);
        }
        if !endpoint.is_live() {
            return Err(Error::Shutdown);
        }

        let id = self.conn_id_counter.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(Connection::new(
            id,
            label,
            attach_mask,
            pool_size,
            pid_ns,
            user_ns,
            endpoint.clone(),
            self.transport.clone(),
        ));
        inner.connections.insert(id, conn.clone());
        Ok(conn)
    }

    /// Convenience wrapper over [`Bus::hello`] for a decoded hello command.
    pub fn hello_from_command(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        cmd: &crate::command::HelloCommand,
        pid_ns: NamespaceHandle,
        user_ns: NamespaceHandle,
    ) -> Result<Arc<Connection>> {
        self.hello(
            endpoint,
            cmd.label.clone(),
            cmd.attach_mask,
            cmd.pool_size,
            pid_ns,
            user_ns,
        )
    }

    pub fn lookup_connection_by_id(&self, id: u64) -> Option<Arc<Connection>> {
        self.inner.lock().connections.get(&id).cloned()
    }

    pub(crate) fn resolve_destination(&self, target: &SendTarget) -> Result<Arc<Connection>> {
        match target {
            SendTarget::Id(id) => self
                .lookup_connection_by_id(*id)
                .ok_or_else(|| Error::InvalidArgument(format!("no connection with id {id}"))),
            SendTarget::Name(name) => {
                let owner = self
                    .registry
                    .lock()
                    .owner(name)
                    .ok_or_else(|| Error::InvalidArgument(format!("name {name} has no owner")))?;
                self.lookup_connection_by_id(owner)
                    .ok_or_else(|| Error::InvalidArgument(format!("owner of {name} vanished")))
            }
        }
    }

    pub(crate) fn acquire_name(&self, conn: &Connection, name: &str, mode: AcquireMode) -> Result<()> {
        let outcome = self.registry.lock().acquire(name, conn.id(), mode)?;
        conn.add_owned_name(name);
        if let crate::registry::AcquireOutcome::Replaced(previous) = outcome {
            if let Some(prev_conn) = self.lookup_connection_by_id(previous) {
                prev_conn.remove_owned_name(name);
            }
        }
        Ok(())
    }

    pub(crate) fn release_name(&self, conn: &Connection, name: &str) -> Result<()> {
        let promoted = self.registry.lock().release(name, conn.id())?;
        conn.remove_owned_name(name);
        if let Some(new_owner) = promoted {
            if let Some(new_conn) = self.lookup_connection_by_id(new_owner) {
                new_conn.add_owned_name(name);
            }
        }
        Ok(())
    }

    pub fn list_names(&self) -> Vec<(String, Option<u64>, usize)> {
        self.registry.lock().list()
    }

    /// Disconnect `conn_id`: release every name it owns (promoting
    /// waiters), unlink it from the connection table, and mark it
    /// disconnected. Idempotent.
    pub fn disconnect_connection(&self, conn_id: u64) {
        let conn = {
            let mut inner = self.inner.lock();
            inner.connections.remove(&conn_id)
        };
        let Some(conn) = conn else { return };

        let changed = self.registry.lock().remove_connection(conn_id);
        for (name, new_owner) in changed {
            if let Some(owner_id) = new_owner {
                if let Some(owner_conn) = self.lookup_connection_by_id(owner_id) {
                    owner_conn.add_owned_name(&name);
                }
            }
        }
        conn.mark_disconnected();
    }

    /// Unlink every endpoint and connection, release every name, and mark
    /// the bus disconnected. Idempotent.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BusState::Disconnected {
            return;
        }
        inner.state = BusState::Disconnected;
        for endpoint in &inner.endpoints {
            endpoint.disconnect();
        }
        for conn in inner.connections.values() {
            conn.mark_disconnected();
        }
        inner.connections.clear();
        inner.endpoints.clear();
        *self.registry.lock() = NameRegistry::new();
    }
}
