//! # Endpoint
//!
//! A named, access-controlled device node on a bus. Every bus gets one
//! endpoint named `"bus"` automatically when it is made; additional
//! endpoints can be created for different access policies on the same
//! bus. Disconnecting an endpoint only blocks new `hello` calls at it —
//! connections already established through it are unaffected.

use crate::bus::Bus;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

bitflags::bitflags! {
    /// Which uid/gid classes may connect through this endpoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u32 {
        /// The bus owner's own uid may connect.
        const OWNER = 1 << 0;
        /// Any uid in the bus owner's user namespace may connect.
        const WORLD = 1 << 1;
        /// A caller-specified group may connect.
        const GROUP = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    Live,
    Disconnected,
}

struct Mutable {
    state: EndpointState,
}

/// A gated entry point into a [`Bus`].
pub struct Endpoint {
    name: String,
    mode: AccessMode,
    uid: u32,
    gid: u32,
    policy_open: bool,
    bus: Arc<Bus>,
    inner: Mutex<Mutable>,
}

impl Endpoint {
    pub(crate) fn new(
        name: String,
        mode: AccessMode,
        uid: u32,
        gid: u32,
        policy_open: bool,
        bus: Arc<Bus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            mode,
            uid,
            gid,
            policy_open,
            bus,
            inner: Mutex::new(Mutable {
                state: EndpointState::Live,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn policy_open(&self) -> bool {
        self.policy_open
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().state == EndpointState::Live
    }

    /// Check whether `caller_uid`/`caller_gid` may open a connection
    /// through this endpoint. A policy-open bus bypasses the access-mode
    /// check entirely.
    pub fn check_access(&self, caller_uid: u32, caller_gid: u32) -> Result<()> {
        if !self.is_live() {
            return Err(Error::Shutdown);
        }
        if self.policy_open {
            return Ok(());
        }
        let allowed = (self.mode.contains(AccessMode::WORLD))
            || (self.mode.contains(AccessMode::OWNER) && caller_uid == self.uid)
            || (self.mode.contains(AccessMode::GROUP) && caller_gid == self.gid);
        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// Reject future `hello` calls at this endpoint. Idempotent; existing
    /// connections are untouched.
    pub fn disconnect(&self) {
        self.inner.lock().state = EndpointState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use std::sync::Arc as StdArc;

    struct NoopTransport;
    impl crate::connection::MessageTransport for NoopTransport {
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

    fn make_bus() -> StdArc<Bus> {
        let ns = Namespace::new_root();
        ns.make_bus(
            "1000-ep",
            1000,
            64,
            None,
            crate::bus::BusFlags::empty(),
            StdArc::new(NoopTransport),
        )
        .unwrap()
    }

    #[test]
    fn world_mode_allows_any_uid() {
        let ns = Namespace::new_root();
        let bus = ns
            .make_bus(
                "1000-ep",
                1000,
                64,
                None,
                crate::bus::BusFlags::ACCESS_WORLD,
                StdArc::new(NoopTransport),
            )
            .unwrap();
        let ep = bus.default_endpoint();
        assert!(ep.check_access(5000, 5000).is_ok());
    }

    #[test]
    fn owner_only_mode_rejects_other_uids() {
        let bus = make_bus();
        let ep = Endpoint::new(
            "restricted".to_string(),
            AccessMode::OWNER,
            1000,
            1000,
            false,
            bus,
        );
        assert!(ep.check_access(1000, 1000).is_ok());
        assert!(ep.check_access(2000, 2000).is_err());
    }

    #[test]
    fn policy_open_bypasses_mode_check() {
        let bus = make_bus();
        let ep = Endpoint::new(
            "open".to_string(),
            AccessMode::OWNER,
            1000,
            1000,
            true,
            bus,
        );
        assert!(ep.check_access(9999, 9999).is_ok());
    }

    #[test]
    fn disconnect_blocks_further_access_checks() {
        let bus = make_bus();
        let ep = bus.default_endpoint();
        ep.disconnect();
        assert!(!ep.is_live());
        assert!(matches!(ep.check_access(1000, 1000), Err(Error::Shutdown)));
    }
}
