//! # kdbus Broker Core
//!
//! The object graph and control-plane decoding at the heart of a
//! kernel-resident IPC broker: nested namespaces, buses, endpoints,
//! connections, a per-bus name registry, a per-message metadata collector,
//! and the make-bus/make-namespace command decoder. Transport delivery,
//! device-node registration, the match/policy database, and host identity
//! queries are modeled as traits other crates fulfill.

pub mod bus;
pub mod cli;
pub mod command;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod item;
pub mod logging;
pub mod metadata;
pub mod namespace;
pub mod registry;
pub mod types;

pub use bus::{Bus, BusFlags};
pub use command::{MakeBusCommand, MakeNamespaceCommand};
pub use connection::{AttachMask, Connection, MessageTransport, SendTarget};
pub use endpoint::{AccessMode, Endpoint};
pub use error::{Error, Result};
pub use item::{ItemBuilder, ItemStream};
pub use metadata::{HostEnvironment, Metadata, MetadataClassMask};
pub use namespace::{Namespace, Subsystem};
pub use registry::{AcquireMode, NameRegistry};
pub use types::ItemType;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fixed resource bounds the core enforces.
pub mod defaults {
    /// Per-connection receive pool size.
    pub const POOL_SIZE: u64 = 16 * 1024 * 1024;

    /// Maximum name string length, including its NUL terminator.
    pub const MAX_NAME_LEN: usize = 64;

    /// Maximum command size: 64 KiB - 1.
    pub const MAX_COMMAND_SIZE: usize = 65535;

    /// Minimum bloom filter size for a bus.
    pub const MIN_BLOOM_SIZE: u32 = 8;

    /// Maximum bloom filter size for a bus.
    pub const MAX_BLOOM_SIZE: u32 = 16384;
}
