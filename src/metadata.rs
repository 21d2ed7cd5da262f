//! # Metadata Collector
//!
//! Builds, on demand, an append-only item stream describing a sender's
//! process identity at send time. Each class is collected at most once per
//! [`Metadata`] object; re-requesting an already-attached class is a no-op,
//! and two metadata objects are only comparable when they pin identical
//! pid- and user-namespace handles.
//!
//! Host-specific process/credential queries are a contract, not an
//! implementation this crate owns: the core assumes the host provides
//! process identity, credentials, and namespace handles on demand.
//! [`HostEnvironment`] is that contract, the same shape as an
//! `IpcTransport` trait describing a concrete transport.

use crate::error::{Error, Result};
use crate::item::ItemBuilder;
use crate::types::ItemType;
use bitflags::bitflags;

bitflags! {
    /// Which metadata classes a connection has attached or will accept,
    /// one bit per class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MetadataClassMask: u64 {
        const TIMESTAMP  = 1 << 0;
        const CREDS      = 1 << 1;
        const AUXGROUPS  = 1 << 2;
        const NAMES      = 1 << 3;
        const COMM       = 1 << 4;
        const EXE        = 1 << 5;
        const CMDLINE    = 1 << 6;
        const CAPS       = 1 << 7;
        const CGROUP     = 1 << 8;
        const AUDIT      = 1 << 9;
        const SECLABEL   = 1 << 10;
        const CONN_NAME  = 1 << 11;
    }
}

/// Fixed collection order. A class earlier in this list is attempted, and
/// may succeed and attach, even if a later class in the same request fails.
const COLLECTION_ORDER: &[MetadataClassMask] = &[
    MetadataClassMask::TIMESTAMP,
    MetadataClassMask::CREDS,
    MetadataClassMask::AUXGROUPS,
    MetadataClassMask::NAMES,
    MetadataClassMask::COMM,
    MetadataClassMask::EXE,
    MetadataClassMask::CMDLINE,
    MetadataClassMask::CAPS,
    MetadataClassMask::CGROUP,
    MetadataClassMask::AUDIT,
    MetadataClassMask::SECLABEL,
    MetadataClassMask::CONN_NAME,
];

/// Opaque handle to a pinned pid- or user-namespace (on Linux: the inode
/// number of `/proc/<pid>/ns/{pid,user}`). Two [`Metadata`] objects are
/// only comparable when both handles match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceHandle(pub u64);

/// Translated process credentials, already mapped into a `Metadata`'s
/// pinned user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Creds {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub tid: u32,
    pub start_time: u64,
}

/// A single capability set, truncated to the host's advertised bit count
/// with unused high bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapSet(pub u64);

impl CapSet {
    /// Clear every bit at or above `bit_count`.
    pub fn clear_unused_high_bits(self, bit_count: u32) -> Self {
        if bit_count >= 64 {
            self
        } else {
            CapSet(self.0 & ((1u64 << bit_count) - 1))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapSets {
    pub inheritable: CapSet,
    pub permitted: CapSet,
    pub effective: CapSet,
    pub bounding: CapSet,
}

/// Host-provided facts needed to collect metadata classes. A `Ok(None)`
/// return means the facility is absent/unsupported on this host — not an
/// error, and the caller must not set the class's attached bit. An `Err`
/// return means a transient failure; the class stays unattached and the
/// same request may be retried later.
pub trait HostEnvironment: Send + Sync {
    fn timestamp(&self, sequence: u64) -> Result<(u64, u64, u64)>;
    fn credentials(&self, pid_ns: NamespaceHandle, user_ns: NamespaceHandle) -> Result<Creds>;
    fn auxiliary_groups(&self, user_ns: NamespaceHandle) -> Result<Vec<u64>>;
    fn comm(&self) -> Result<(Vec<u8>, Vec<u8>)>;
    fn executable_path(&self) -> Result<Vec<u8>>;
    fn cmdline(&self) -> Result<Vec<u8>>;
    fn capabilities(&self) -> Result<CapSets>;
    fn cgroup_path(&self) -> Result<Option<Vec<u8>>>;
    fn audit(&self, user_ns: NamespaceHandle) -> Result<Option<(u64, u64)>>;
    fn security_label(&self) -> Result<Option<Vec<u8>>>;
}

/// The two pieces of a sender connection the collector needs that the host
/// doesn't own: its currently-owned names and its diagnostic label. Kept as
/// a small trait (rather than a direct `&Connection` dependency) so this
/// module doesn't need to know about bus/connection locking.
pub trait ConnectionMetadataSource {
    fn owned_names(&self) -> Vec<(String, u64)>;
    fn label(&self) -> Option<String>;
}

/// An append-only buffer of metadata item records, pinned to the pid- and
/// user-namespace it was constructed in.
pub struct Metadata {
    pid_ns: NamespaceHandle,
    user_ns: NamespaceHandle,
    attached: MetadataClassMask,
    builder: ItemBuilder,
}

impl Metadata {
    pub fn new(pid_ns: NamespaceHandle, user_ns: NamespaceHandle) -> Self {
        Self {
            pid_ns,
            user_ns,
            attached: MetadataClassMask::empty(),
            builder: ItemBuilder::new(),
        }
    }

    pub fn attached_classes(&self) -> MetadataClassMask {
        self.attached
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.builder.as_slice()
    }

    pub fn pid_namespace(&self) -> NamespaceHandle {
        self.pid_ns
    }

    pub fn user_namespace(&self) -> NamespaceHandle {
        self.user_ns
    }

    /// Two metadata objects are comparable only if both pinned namespaces
    /// are identical.
    pub fn comparable_to(&self, other: &Metadata) -> bool {
        self.pid_ns == other.pid_ns && self.user_ns == other.user_ns
    }

    /// Collect every requested, not-yet-attached class. Classes already
    /// attached are skipped (idempotent). On the first class whose
    /// collection fails transiently, returns that error immediately,
    /// leaving classes collected earlier in this call attached and the
    /// failing class (and anything after it in [`COLLECTION_ORDER`])
    /// unattached for a later retry.
    pub fn collect(
        &mut self,
        requested: MetadataClassMask,
        host: &dyn HostEnvironment,
        conn: &dyn ConnectionMetadataSource,
        sequence: u64,
    ) -> Result<()> {
        for &class in COLLECTION_ORDER {
            if !requested.contains(class) || self.attached.contains(class) {
                continue;
            }
            self.collect_one(class, host, conn, sequence)?;
        }
        Ok(())
    }

    fn collect_one(
        &mut self,
        class: MetadataClassMask,
        host: &dyn HostEnvironment,
        conn: &dyn ConnectionMetadataSource,
        sequence: u64,
    ) -> Result<()> {
        match class {
            MetadataClassMask::TIMESTAMP => {
                let (mono, real, seq) = host.timestamp(sequence)?;
                let mut payload = Vec::with_capacity(24);
                payload.extend_from_slice(&mono.to_le_bytes());
                payload.extend_from_slice(&real.to_le_bytes());
                payload.extend_from_slice(&seq.to_le_bytes());
                self.builder.push_item(ItemType::Timestamp.code(), &payload)?;
                self.attached.insert(class);
            }
            MetadataClassMask::CREDS => {
                let creds = host.credentials(self.pid_ns, self.user_ns)?;
                let mut payload = Vec::with_capacity(40);
                payload.extend_from_slice(&(creds.uid as u64).to_le_bytes());
                payload.extend_from_slice(&(creds.gid as u64).to_le_bytes());
                payload.extend_from_slice(&(creds.pid as u64).to_le_bytes());
                payload.extend_from_slice(&(creds.tid as u64).to_le_bytes());
                payload.extend_from_slice(&creds.start_time.to_le_bytes());
                self.builder.push_item(ItemType::Creds.code(), &payload)?;
                self.attached.insert(class);
            }
            MetadataClassMask::AUXGROUPS => {
                let gids = host.auxiliary_groups(self.user_ns)?;
                if gids.is_empty() {
                    self.builder.push_placeholder(ItemType::AuxGroups.code())?;
                } else {
                    let mut payload = Vec::with_capacity(gids.len() * 8);
                    for gid in gids {
                        payload.extend_from_slice(&gid.to_le_bytes());
                    }
                    self.builder.push_item(ItemType::AuxGroups.code(), &payload)?;
                }
                self.attached.insert(class);
            }
            MetadataClassMask::NAMES => {
                for (name, flags) in conn.owned_names() {
                    let mut payload = Vec::with_capacity(8 + name.len() + 1);
                    payload.extend_from_slice(&flags.to_le_bytes());
                    payload.extend_from_slice(name.as_bytes());
                    payload.push(0);
                    self.builder.push_item(ItemType::OwnedName.code(), &payload)?;
                }
                self.attached.insert(class);
            }
            MetadataClassMask::COMM => {
                let (tgid_comm, tid_comm) = host.comm()?;
                self.builder
                    .push_item(ItemType::CommTgid.code(), &tgid_comm)?;
                self.builder.push_item(ItemType::CommPid.code(), &tid_comm)?;
                self.attached.insert(class);
            }
            MetadataClassMask::EXE => {
                let mut path = host.executable_path()?;
                path.push(0);
                self.builder.push_item(ItemType::Exe.code(), &path)?;
                self.attached.insert(class);
            }
            MetadataClassMask::CMDLINE => {
                let cmdline = host.cmdline()?;
                if cmdline.is_empty() {
                    self.builder.push_placeholder(ItemType::Cmdline.code())?;
                } else {
                    self.builder.push_item(ItemType::Cmdline.code(), &cmdline)?;
                }
                self.attached.insert(class);
            }
            MetadataClassMask::CAPS => {
                let caps = host.capabilities()?;
                self.builder
                    .push_item(ItemType::CapInheritable.code(), &caps.inheritable.0.to_le_bytes())?;
                self.builder
                    .push_item(ItemType::CapPermitted.code(), &caps.permitted.0.to_le_bytes())?;
                self.builder
                    .push_item(ItemType::CapEffective.code(), &caps.effective.0.to_le_bytes())?;
                self.builder
                    .push_item(ItemType::CapBounding.code(), &caps.bounding.0.to_le_bytes())?;
                self.attached.insert(class);
            }
            MetadataClassMask::CGROUP => {
                if let Some(mut path) = host.cgroup_path()? {
                    path.push(0);
                    self.builder.push_item(ItemType::Cgroup.code(), &path)?;
                    self.attached.insert(class);
                }
                // None: host has no cgroup hierarchy configured. Not an
                // error; bit intentionally left unset.
            }
            MetadataClassMask::AUDIT => {
                if let Some((loginuid, session)) = host.audit(self.user_ns)? {
                    let mut payload = Vec::with_capacity(16);
                    payload.extend_from_slice(&loginuid.to_le_bytes());
                    payload.extend_from_slice(&session.to_le_bytes());
                    self.builder.push_item(ItemType::AuditLoginUid.code(), &payload)?;
                    self.attached.insert(class);
                }
            }
            MetadataClassMask::SECLABEL => {
                if let Some(label) = host.security_label()? {
                    if label.is_empty() {
                        self.builder.push_placeholder(ItemType::SecLabel.code())?;
                    } else {
                        self.builder.push_item(ItemType::SecLabel.code(), &label)?;
                    }
                    self.attached.insert(class);
                }
            }
            MetadataClassMask::CONN_NAME => {
                if let Some(label) = conn.label() {
                    let mut payload = label.into_bytes();
                    payload.push(0);
                    self.builder.push_item(ItemType::ConnName.code(), &payload)?;
                }
                self.attached.insert(class);
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "unrecognized metadata class bits: {class:?}"
                )))
            }
        }
        Ok(())
    }
}

/// A real-host [`HostEnvironment`] backed by `/proc` and `nix`'s
/// credential queries. Capability, cgroup, audit, and security-label
/// capture are opaque host-facility queries this crate leaves
/// unmodeled; this implementation reports them as absent rather than
/// pulling in a dedicated capability/audit crate the rest of the stack
/// has no other use for.
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct LinuxHostEnvironment;

#[cfg(target_os = "linux")]
impl HostEnvironment for LinuxHostEnvironment {
    fn timestamp(&self, sequence: u64) -> Result<(u64, u64, u64)> {
        use std::time::{SystemTime, UNIX_EPOCH};
        let realtime_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let monotonic_ns = {
            let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
                .map_err(|e| Error::BadMessage(format!("clock_gettime failed: {e}")))?;
            (ts.tv_sec() as u64)
                .saturating_mul(1_000_000_000)
                .saturating_add(ts.tv_nsec() as u64)
        };
        Ok((monotonic_ns, realtime_ns, sequence))
    }

    fn credentials(&self, _pid_ns: NamespaceHandle, _user_ns: NamespaceHandle) -> Result<Creds> {
        Ok(Creds {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            pid: nix::unistd::getpid().as_raw() as u32,
            tid: nix::unistd::getpid().as_raw() as u32,
            start_time: 0,
        })
    }

    fn auxiliary_groups(&self, _user_ns: NamespaceHandle) -> Result<Vec<u64>> {
        Ok(nix::unistd::getgroups()
            .map_err(|e| Error::BadMessage(format!("getgroups failed: {e}")))?
            .into_iter()
            .map(|gid| gid.as_raw() as u64)
            .collect())
    }

    fn comm(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let comm = std::fs::read("/proc/self/comm")
            .map_err(|e| Error::BadMessage(format!("reading /proc/self/comm failed: {e}")))?;
        Ok((comm.clone(), comm))
    }

    fn executable_path(&self) -> Result<Vec<u8>> {
        let path = std::fs::read_link("/proc/self/exe")
            .map_err(|e| Error::BadMessage(format!("reading /proc/self/exe failed: {e}")))?;
        Ok(path.to_string_lossy().into_owned().into_bytes())
    }

    fn cmdline(&self) -> Result<Vec<u8>> {
        std::fs::read("/proc/self/cmdline")
            .map_err(|e| Error::BadMessage(format!("reading /proc/self/cmdline failed: {e}")))
    }

    fn capabilities(&self) -> Result<CapSets> {
        Ok(CapSets::default())
    }

    fn cgroup_path(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn audit(&self, _user_ns: NamespaceHandle) -> Result<Option<(u64, u64)>> {
        Ok(None)
    }

    fn security_label(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Test doubles for [`HostEnvironment`] and [`ConnectionMetadataSource`].
///
/// Gated behind the `test-util` feature rather than `#[cfg(test)]` so
/// that `tests/` integration binaries, which link the library as an
/// ordinary (non-test) rlib, can see it too.
#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A deterministic, in-memory [`HostEnvironment`] for tests: no real
    /// syscalls, every facility present unless explicitly disabled.
    pub struct MockHostEnvironment {
        pub uid: u32,
        pub gid: u32,
        pub pid: u32,
        pub tid: u32,
        pub cgroup: Option<Vec<u8>>,
        pub audit: Option<(u64, u64)>,
        pub seclabel: Option<Vec<u8>>,
        monotonic: AtomicU64,
    }

    impl Default for MockHostEnvironment {
        fn default() -> Self {
            Self {
                uid: 1000,
                gid: 1000,
                pid: 4242,
                tid: 4242,
                cgroup: Some(b"/user.slice/test.service".to_vec()),
                audit: Some((1000, 7)),
                seclabel: Some(b"unconfined".to_vec()),
                monotonic: AtomicU64::new(1),
            }
        }
    }

    impl HostEnvironment for MockHostEnvironment {
        fn timestamp(&self, sequence: u64) -> Result<(u64, u64, u64)> {
            let mono = self.monotonic.fetch_add(1, Ordering::Relaxed);
            Ok((mono, 1_700_000_000_000_000_000 + mono, sequence))
        }

        fn credentials(&self, _pid_ns: NamespaceHandle, _user_ns: NamespaceHandle) -> Result<Creds> {
            Ok(Creds {
                uid: self.uid,
                gid: self.gid,
                pid: self.pid,
                tid: self.tid,
                start_time: 123456,
            })
        }

        fn auxiliary_groups(&self, _user_ns: NamespaceHandle) -> Result<Vec<u64>> {
            Ok(vec![27, 100])
        }

        fn comm(&self) -> Result<(Vec<u8>, Vec<u8>)> {
            Ok((b"leader".to_vec(), b"worker".to_vec()))
        }

        fn executable_path(&self) -> Result<Vec<u8>> {
            Ok(b"/usr/bin/test-client".to_vec())
        }

        fn cmdline(&self) -> Result<Vec<u8>> {
            Ok(b"test-client\0--flag\0".to_vec())
        }

        fn capabilities(&self) -> Result<CapSets> {
            Ok(CapSets {
                inheritable: CapSet(0),
                permitted: CapSet(0x3f).clear_unused_high_bits(40),
                effective: CapSet(0x3f).clear_unused_high_bits(40),
                bounding: CapSet(u64::MAX).clear_unused_high_bits(40),
            })
        }

        fn cgroup_path(&self) -> Result<Option<Vec<u8>>> {
            Ok(self.cgroup.clone())
        }

        fn audit(&self, _user_ns: NamespaceHandle) -> Result<Option<(u64, u64)>> {
            Ok(self.audit)
        }

        fn security_label(&self) -> Result<Option<Vec<u8>>> {
            Ok(self.seclabel.clone())
        }
    }

    pub struct MockSender {
        pub names: Vec<(String, u64)>,
        pub label: Option<String>,
    }

    impl ConnectionMetadataSource for MockSender {
        fn owned_names(&self) -> Vec<(String, u64)> {
            self.names.clone()
        }

        fn label(&self) -> Option<String> {
            self.label.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::item::ItemStream;

    fn fresh() -> (Metadata, MockHostEnvironment, MockSender) {
        (
            Metadata::new(NamespaceHandle(1), NamespaceHandle(1)),
            MockHostEnvironment::default(),
            MockSender {
                names: vec![("1000-foo".to_string(), 0)],
                label: Some("my-client".to_string()),
            },
        )
    }

    #[test]
    fn collecting_timestamp_creds_comm_yields_exactly_four_records() {
        let (mut meta, host, sender) = fresh();
        let mask = MetadataClassMask::TIMESTAMP | MetadataClassMask::CREDS | MetadataClassMask::COMM;
        meta.collect(mask, &host, &sender, 0).unwrap();

        let items: Vec<_> = ItemStream::new(meta.as_bytes())
            .iter()
            .collect::<Result<_>>()
            .unwrap();
        // timestamp: 1, creds: 1, comm: 2
        assert_eq!(items.len(), 4);
        assert_eq!(meta.attached_classes(), mask);
    }

    #[test]
    fn re_requesting_the_same_mask_appends_nothing() {
        let (mut meta, host, sender) = fresh();
        let mask = MetadataClassMask::TIMESTAMP | MetadataClassMask::CREDS;
        meta.collect(mask, &host, &sender, 0).unwrap();
        let first_len = meta.as_bytes().len();

        meta.collect(mask, &host, &sender, 0).unwrap();
        assert_eq!(meta.as_bytes().len(), first_len);
    }

    #[test]
    fn requesting_a_superset_only_appends_the_new_class() {
        let (mut meta, host, sender) = fresh();
        meta.collect(MetadataClassMask::TIMESTAMP, &host, &sender, 0)
            .unwrap();
        let after_timestamp = meta.as_bytes().len();

        meta.collect(
            MetadataClassMask::TIMESTAMP | MetadataClassMask::EXE,
            &host,
            &sender,
            0,
        )
        .unwrap();

        let items: Vec<_> = ItemStream::new(meta.as_bytes())
            .iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(meta.as_bytes().len() > after_timestamp);
    }

    #[test]
    fn unsupported_host_facility_sets_no_bit_and_is_not_an_error() {
        let mut host = MockHostEnvironment::default();
        host.cgroup = None;
        let mut meta = Metadata::new(NamespaceHandle(1), NamespaceHandle(1));
        let sender = MockSender {
            names: vec![],
            label: None,
        };

        meta.collect(MetadataClassMask::CGROUP, &host, &sender, 0)
            .unwrap();
        assert!(!meta.attached_classes().contains(MetadataClassMask::CGROUP));
        assert!(meta.as_bytes().is_empty());
    }

    #[test]
    fn metadata_objects_from_different_namespaces_are_not_comparable() {
        let a = Metadata::new(NamespaceHandle(1), NamespaceHandle(1));
        let b = Metadata::new(NamespaceHandle(2), NamespaceHandle(1));
        assert!(!a.comparable_to(&b));
        let c = Metadata::new(NamespaceHandle(1), NamespaceHandle(1));
        assert!(a.comparable_to(&c));
    }

    #[test]
    fn names_class_emits_one_record_per_owned_name() {
        let (mut meta, host, _) = fresh();
        let sender = MockSender {
            names: vec![
                ("1000-a".to_string(), 0),
                ("1000-b".to_string(), 0),
                ("1000-c".to_string(), 0),
            ],
            label: None,
        };
        meta.collect(MetadataClassMask::NAMES, &host, &sender, 0)
            .unwrap();
        let items: Vec<_> = ItemStream::new(meta.as_bytes())
            .iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn cap_set_clears_unused_high_bits() {
        let caps = CapSet(u64::MAX).clear_unused_high_bits(40);
        assert_eq!(caps.0, (1u64 << 40) - 1);
    }
}
