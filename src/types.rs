//! # Item Type Codes
//!
//! A bounded enum over every item tag this crate's item streams can carry,
//! across commands, `hello`, and metadata. Variable-length tagged records
//! are modeled as a tagged sum over this bounded enum rather than generic
//! blobs; an unknown tag is a distinguishable case the decoder rejects with
//! not-supported.

/// Tag carried in every item's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ItemType {
    /// make-bus / make-namespace: the new object's name (string).
    MakeName = 1,
    /// make-bus: the cgroup hierarchy id to attach (u64).
    MakeCgroup = 2,
    /// hello: the connection's human-readable label (string).
    ConnName = 3,
    /// hello: requested attach-mask (u64 bitmask).
    AttachFlags = 4,
    /// hello: requested receive-pool size in bytes (u64).
    PoolSize = 5,
    /// metadata: monotonic_ns, realtime_ns, sequence (3x u64).
    Timestamp = 6,
    /// metadata: uid, gid, pid, tid, start-time (5x u64, namespace-translated).
    Creds = 7,
    /// metadata: sequence of u64 gids, namespace-translated.
    AuxGroups = 8,
    /// metadata: one of the sender's currently owned names (flags u64 + NUL string).
    OwnedName = 9,
    /// metadata: thread-group leader comm string.
    CommTgid = 10,
    /// metadata: calling thread's comm string.
    CommPid = 11,
    /// metadata: absolute executable path.
    Exe = 12,
    /// metadata: raw argv area, up to one page.
    Cmdline = 13,
    /// metadata: inheritable capability set (u64 mask).
    CapInheritable = 14,
    /// metadata: permitted capability set (u64 mask).
    CapPermitted = 15,
    /// metadata: effective capability set (u64 mask).
    CapEffective = 16,
    /// metadata: bounding capability set (u64 mask).
    CapBounding = 17,
    /// metadata: cgroup path in the bus's configured hierarchy.
    Cgroup = 18,
    /// metadata: audit login uid, namespace-translated (u64).
    AuditLoginUid = 19,
    /// metadata: audit session id (u64).
    AuditSessionId = 20,
    /// metadata: opaque security-module label bytes.
    SecLabel = 21,
}

impl ItemType {
    pub const fn code(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for ItemType {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::MakeName,
            2 => Self::MakeCgroup,
            3 => Self::ConnName,
            4 => Self::AttachFlags,
            5 => Self::PoolSize,
            6 => Self::Timestamp,
            7 => Self::Creds,
            8 => Self::AuxGroups,
            9 => Self::OwnedName,
            10 => Self::CommTgid,
            11 => Self::CommPid,
            12 => Self::Exe,
            13 => Self::Cmdline,
            14 => Self::CapInheritable,
            15 => Self::CapPermitted,
            16 => Self::CapEffective,
            17 => Self::CapBounding,
            18 => Self::Cgroup,
            19 => Self::AuditLoginUid,
            20 => Self::AuditSessionId,
            21 => Self::SecLabel,
            _ => return Err(()),
        })
    }
}
