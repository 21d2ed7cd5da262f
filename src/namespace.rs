//! # Namespace and Subsystem Facade
//!
//! A namespace is a tree of buses sharing a devpath prefix: the root
//! namespace (no parent, devpath `"kdbus"`) plus optional nested children,
//! each devpath-composed as `"kdbus/ns/<parent.devpath>/<name>"`. Bus ids
//! are allocated monotonically within a namespace and never reused.
//!
//! [`Subsystem`] is the single facade over the global mutable state this
//! crate otherwise has none of: the flat namespace list and the dynamic
//! major-number allocator every new namespace consumes one of. Keeping
//! that state behind one type, rather than a bare static, is what lets the
//! global lock stay first and only in the documented lock order.

use crate::bus::{Bus, BusFlags};
use crate::connection::MessageTransport;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NamespaceState {
    Live,
    Disconnected,
}

struct Mutable {
    state: NamespaceState,
    buses: HashMap<String, Arc<Bus>>,
    children: HashMap<String, Arc<Namespace>>,
}

/// A container of buses with a devpath prefix; may be nested.
pub struct Namespace {
    id: u64,
    name: Option<String>,
    devpath: String,
    major: u32,
    bus_id_counter: AtomicU64,
    inner: Mutex<Mutable>,
}

impl Namespace {
    /// Construct a standalone root namespace, outside any [`Subsystem`].
    /// Exists mainly so other modules' unit tests don't need a full
    /// subsystem just to make a bus.
    pub fn new_root() -> Arc<Self> {
        Arc::new(Self {
            id: 0,
            name: None,
            devpath: "kdbus".to_string(),
            major: 0,
            bus_id_counter: AtomicU64::new(1),
            inner: Mutex::new(Mutable {
                state: NamespaceState::Live,
                buses: HashMap::new(),
                children: HashMap::new(),
            }),
        })
    }

    pub(crate) fn construct_child(id: u64, name: String, major: u32, parent: &Namespace) -> Arc<Self> {
        Arc::new(Self {
            id,
            devpath: format!("{}/ns/{}", parent.devpath, name),
            name: Some(name),
            major,
            bus_id_counter: AtomicU64::new(1),
            inner: Mutex::new(Mutable {
                state: NamespaceState::Live,
                buses: HashMap::new(),
                children: HashMap::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn devpath(&self) -> &str {
        &self.devpath
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().state == NamespaceState::Live
    }

    pub fn control_node_path(&self) -> String {
        format!("/dev/{}/control", self.devpath)
    }

    /// Create a bus in this namespace. `uid` is used both for the
    /// `"<uid>-"` name-prefix check and, absent a distinct group, as the
    /// bus's owning gid. `flags` carries `ACCESS_WORLD`/`POLICY_OPEN`,
    /// which the bus's auto-created default endpoint inherits.
    pub fn make_bus(
        self: &Arc<Self>,
        name: &str,
        uid: u32,
        bloom_size: u32,
        cgroup_id: Option<u64>,
        flags: BusFlags,
        transport: Arc<dyn MessageTransport>,
    ) -> Result<Arc<Bus>> {
        let mut inner = self.inner.lock();
        if inner.state != NamespaceState::Live {
            return Err(Error::Shutdown);
        }
        if inner.buses.contains_key(name) {
            return Err(Error::AlreadyExists);
        }
        let bus_id = self.bus_id_counter.fetch_add(1, Ordering::SeqCst);
        let bus = Bus::construct(
            bus_id,
            name.to_string(),
            uid,
            uid,
            bloom_size,
            cgroup_id,
            flags,
            self.clone(),
            transport,
        )?;
        inner.buses.insert(name.to_string(), bus.clone());
        Ok(bus)
    }

    /// Convenience wrapper over [`Namespace::make_bus`] for a decoded
    /// make-bus command: the command's `flags` field is forwarded as-is.
    pub fn make_bus_from_command(
        self: &Arc<Self>,
        cmd: &crate::command::MakeBusCommand,
        caller_uid: u32,
        transport: Arc<dyn MessageTransport>,
    ) -> Result<Arc<Bus>> {
        self.make_bus(
            &cmd.name,
            caller_uid,
            cmd.bloom_size,
            cmd.cgroup_id,
            BusFlags::from_bits_truncate(cmd.flags),
            transport,
        )
    }

    pub fn lookup_bus(&self, name: &str) -> Option<Arc<Bus>> {
        self.inner.lock().buses.get(name).cloned()
    }

    pub fn list_buses(&self) -> Vec<Arc<Bus>> {
        self.inner.lock().buses.values().cloned().collect()
    }

    pub fn list_children(&self) -> Vec<Arc<Namespace>> {
        self.inner.lock().children.values().cloned().collect()
    }

    pub(crate) fn link_child(&self, name: String, child: Arc<Namespace>) {
        self.inner.lock().children.insert(name, child);
    }

    pub(crate) fn has_child(&self, name: &str) -> bool {
        self.inner.lock().children.contains_key(name)
    }

    /// Unlink every bus and child namespace and mark disconnected.
    /// Idempotent.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        if inner.state == NamespaceState::Disconnected {
            return;
        }
        inner.state = NamespaceState::Disconnected;
        for bus in inner.buses.values() {
            bus.disconnect();
        }
        for child in inner.children.values() {
            child.disconnect();
        }
        inner.buses.clear();
        inner.children.clear();
    }
}

#[derive(Debug, Serialize)]
pub struct NamespaceSnapshot {
    pub id: u64,
    pub name: Option<String>,
    pub devpath: String,
    pub buses: Vec<BusSnapshot>,
    pub children: Vec<NamespaceSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct BusSnapshot {
    pub id: u64,
    pub name: String,
    pub bloom_size: u32,
    pub owner_uid: u32,
    pub names: Vec<NameSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct NameSnapshot {
    pub name: String,
    pub owner: Option<u64>,
    pub waiters: usize,
}

fn snapshot_namespace(ns: &Namespace) -> NamespaceSnapshot {
    NamespaceSnapshot {
        id: ns.id(),
        name: ns.name().map(str::to_string),
        devpath: ns.devpath().to_string(),
        buses: ns
            .list_buses()
            .into_iter()
            .map(|bus| BusSnapshot {
                id: bus.id(),
                name: bus.name().to_string(),
                bloom_size: bus.bloom_size(),
                owner_uid: bus.owner_uid(),
                names: bus
                    .list_names()
                    .into_iter()
                    .map(|(name, owner, waiters)| NameSnapshot {
                        name,
                        owner,
                        waiters,
                    })
                    .collect(),
            })
            .collect(),
        children: ns.list_children().iter().map(|c| snapshot_namespace(c)).collect(),
    }
}

struct SubsystemInner {
    namespaces: HashMap<u64, Arc<Namespace>>,
    next_namespace_id: u64,
    next_major: u32,
}

/// The single facade over global subsystem state: the flat namespace list
/// and the dynamic major-number allocator. Constructing a [`Subsystem`]
/// creates the root namespace automatically.
pub struct Subsystem {
    root: Arc<Namespace>,
    inner: Mutex<SubsystemInner>,
}

impl Subsystem {
    pub fn new() -> Self {
        let root = Namespace::new_root();
        let mut namespaces = HashMap::new();
        namespaces.insert(root.id(), root.clone());
        Self {
            root,
            inner: Mutex::new(SubsystemInner {
                namespaces,
                next_namespace_id: 1,
                next_major: 1,
            }),
        }
    }

    pub fn root(&self) -> Arc<Namespace> {
        self.root.clone()
    }

    /// Create a child namespace of `parent`. Sibling names must be
    /// unique.
    pub fn make_namespace(&self, parent: &Arc<Namespace>, name: &str) -> Result<Arc<Namespace>> {
        if !parent.is_live() {
            return Err(Error::Shutdown);
        }
        if parent.has_child(name) {
            return Err(Error::AlreadyExists);
        }
        let mut inner = self.inner.lock();
        let id = inner.next_namespace_id;
        let major = inner.next_major;
        inner.next_namespace_id += 1;
        inner.next_major += 1;

        let child = Namespace::construct_child(id, name.to_string(), major, parent);
        inner.namespaces.insert(id, child.clone());
        parent.link_child(name.to_string(), child.clone());
        Ok(child)
    }

    /// Convenience wrapper over [`Subsystem::make_namespace`] for a
    /// decoded make-namespace command.
    pub fn make_namespace_from_command(
        &self,
        parent: &Arc<Namespace>,
        cmd: &crate::command::MakeNamespaceCommand,
    ) -> Result<Arc<Namespace>> {
        self.make_namespace(parent, &cmd.name)
    }

    pub fn lookup_namespace(&self, id: u64) -> Option<Arc<Namespace>> {
        self.inner.lock().namespaces.get(&id).cloned()
    }

    pub fn snapshot(&self) -> NamespaceSnapshot {
        snapshot_namespace(&self.root)
    }
}

impl Default for Subsystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTransport;
    impl MessageTransport for NoopTransport {
        fn deliver(
            &self,
            _sender: u64,
            _recipient: u64,
            _payload: &[u8],
            _metadata: &[u8],
            _timeout: Option<std::time::Duration>,
        ) -> Result<()> {
            Ok(())
        }
        fn release_pool_offset(&self, _conn_id: u64, _offset: u64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn root_devpath_is_kdbus() {
        let sub = Subsystem::new();
        assert_eq!(sub.root().devpath(), "kdbus");
        assert!(sub.root().name().is_none());
    }

    #[test]
    fn child_devpath_is_composed_under_parent() {
        let sub = Subsystem::new();
        let child = sub.make_namespace(&sub.root(), "alpha").unwrap();
        assert_eq!(child.devpath(), "kdbus/ns/alpha");
    }

    #[test]
    fn sibling_namespace_names_must_be_unique() {
        let sub = Subsystem::new();
        sub.make_namespace(&sub.root(), "alpha").unwrap();
        let err = sub.make_namespace(&sub.root(), "alpha").unwrap_err();
        assert_eq!(err, Error::AlreadyExists);
    }

    #[test]
    fn bus_ids_increase_monotonically_within_a_namespace() {
        let ns = Namespace::new_root();
        let b1 = ns
            .make_bus("1000-a", 1000, 64, None, BusFlags::empty(), Arc::new(NoopTransport))
            .unwrap();
        let b2 = ns
            .make_bus("1000-b", 1000, 64, None, BusFlags::empty(), Arc::new(NoopTransport))
            .unwrap();
        assert_eq!(b1.id(), 1);
        assert_eq!(b2.id(), 2);
    }

    #[test]
    fn disconnect_is_idempotent_and_clears_child_lists() {
        let ns = Namespace::new_root();
        ns.make_bus("1000-a", 1000, 64, None, BusFlags::empty(), Arc::new(NoopTransport))
            .unwrap();
        ns.disconnect();
        ns.disconnect();
        assert!(ns.list_buses().is_empty());
        assert!(!ns.is_live());
    }

    #[test]
    fn snapshot_reflects_created_buses_and_names() {
        let sub = Subsystem::new();
        let bus = sub
            .root()
            .make_bus("1000-a", 1000, 64, None, BusFlags::empty(), Arc::new(NoopTransport))
            .unwrap();
        let endpoint = bus.default_endpoint();
        let conn = bus
            .hello(
                &endpoint,
                None,
                crate::connection::AttachMask::empty(),
                4096,
                crate::metadata::NamespaceHandle(1),
                crate::metadata::NamespaceHandle(1),
            )
            .unwrap();
        conn.acquire_name("1000-svc", crate::registry::AcquireMode::FailIfTaken)
            .unwrap();

        let snap = sub.snapshot();
        assert_eq!(snap.buses.len(), 1);
        assert_eq!(snap.buses[0].names[0].name, "1000-svc");
    }
}
