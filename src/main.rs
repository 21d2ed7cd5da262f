//! # kdbus-demo
//!
//! A small driver for the broker core: builds a subsystem, encodes one
//! make-namespace, one make-bus, and one hello command exactly as a host
//! ioctl dispatcher would receive them from user memory, decodes and
//! applies all three, has the resulting connection acquire a name, then
//! prints the resulting graph.

use anyhow::{Context, Result};
use clap::Parser;
use kdbus_broker_core::cli::Args;
use kdbus_broker_core::command::{self, HELLO_HEADER_SIZE, MAKE_BUS_HEADER_SIZE, MAKE_NAMESPACE_HEADER_SIZE};
use kdbus_broker_core::connection::{AttachMask, MessageTransport, SendTarget};
use kdbus_broker_core::item::ItemBuilder;
use kdbus_broker_core::logging;
use kdbus_broker_core::metadata::NamespaceHandle;
use kdbus_broker_core::namespace::Subsystem;
use kdbus_broker_core::registry::AcquireMode;
use kdbus_broker_core::types::ItemType;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// A transport that just logs what it would have delivered; the actual
/// receive-pool mmap and kernel-to-user copy are out of this crate's
/// scope.
struct LoggingTransport;

impl MessageTransport for LoggingTransport {
    fn deliver(
        &self,
        sender: u64,
        recipient: u64,
        payload: &[u8],
        metadata: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<(), kdbus_broker_core::error::Error> {
        info!(
            sender,
            recipient,
            payload_len = payload.len(),
            metadata_len = metadata.len(),
            "delivered message"
        );
        Ok(())
    }

    fn release_pool_offset(&self, conn_id: u64, offset: u64) -> Result<(), kdbus_broker_core::error::Error> {
        info!(conn_id, offset, "released pool offset");
        Ok(())
    }
}

fn encode_make_namespace(name: &str) -> Vec<u8> {
    let mut items = ItemBuilder::new();
    let mut payload = name.as_bytes().to_vec();
    payload.push(0);
    items.push_item(ItemType::MakeName.code(), &payload).unwrap();
    let item_bytes = items.finish();

    let mut buf = Vec::with_capacity(MAKE_NAMESPACE_HEADER_SIZE + item_bytes.len());
    let total = (MAKE_NAMESPACE_HEADER_SIZE + item_bytes.len()) as u64;
    buf.extend_from_slice(&total.to_le_bytes());
    buf.extend_from_slice(&item_bytes);
    buf
}

fn encode_make_bus(name: &str, bloom_size: u32) -> Vec<u8> {
    let mut items = ItemBuilder::new();
    let mut payload = name.as_bytes().to_vec();
    payload.push(0);
    items.push_item(ItemType::MakeName.code(), &payload).unwrap();
    let item_bytes = items.finish();

    let mut buf = Vec::with_capacity(MAKE_BUS_HEADER_SIZE + item_bytes.len());
    let total = (MAKE_BUS_HEADER_SIZE + item_bytes.len()) as u64;
    buf.extend_from_slice(&total.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes()); // flags
    buf.extend_from_slice(&(bloom_size as u64).to_le_bytes());
    buf.extend_from_slice(&item_bytes);
    buf
}

fn encode_hello(label: &str, pool_size: u64) -> Vec<u8> {
    let mut items = ItemBuilder::new();
    let mut payload = label.as_bytes().to_vec();
    payload.push(0);
    items.push_item(ItemType::ConnName.code(), &payload).unwrap();
    items
        .push_item(ItemType::PoolSize.code(), &pool_size.to_le_bytes())
        .unwrap();
    let item_bytes = items.finish();

    let mut buf = Vec::with_capacity(HELLO_HEADER_SIZE + item_bytes.len());
    let total = (HELLO_HEADER_SIZE + item_bytes.len()) as u64;
    buf.extend_from_slice(&total.to_le_bytes());
    buf.extend_from_slice(&item_bytes);
    buf
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.log_file.as_deref(), args.quiet);

    let subsystem = Subsystem::new();
    let root = subsystem.root();

    let ns_cmd_buf = encode_make_namespace(&args.namespace_name);
    let ns_cmd = command::decode_make_namespace(&ns_cmd_buf).context("decoding make-namespace command")?;
    let namespace = subsystem
        .make_namespace_from_command(&root, &ns_cmd)
        .context("applying make-namespace command")?;
    info!(name = %ns_cmd.name, devpath = %namespace.devpath(), "namespace created");

    let full_bus_name = format!("{}-{}", args.caller_uid, args.bus_name);
    let bus_cmd_buf = encode_make_bus(&full_bus_name, args.bloom_size);
    let bus_cmd = match command::decode_make_bus(&bus_cmd_buf) {
        Ok(cmd) => cmd,
        Err(err) => {
            error!(%err, "decoding make-bus command failed");
            return Err(err.into());
        }
    };
    let bus = namespace
        .make_bus_from_command(&bus_cmd, args.caller_uid, Arc::new(LoggingTransport))
        .context("applying make-bus command")?;
    info!(name = %bus.name(), bloom_size = bus.bloom_size(), "bus created");

    let endpoint = bus.default_endpoint();
    let hello_cmd_buf = encode_hello("kdbus-demo", 4096);
    let hello_cmd = command::decode_hello(&hello_cmd_buf).context("decoding hello command")?;
    let conn = bus
        .hello_from_command(&endpoint, &hello_cmd, NamespaceHandle(1), NamespaceHandle(1))
        .context("hello failed")?;
    info!(conn_id = conn.id(), "connection established");

    let well_known = format!("{}-demo-service", args.caller_uid);
    conn.acquire_name(&well_known, AcquireMode::FailIfTaken)
        .context("acquiring name failed")?;
    info!(name = %well_known, "name acquired");

    let host = kdbus_broker_core::metadata::LinuxHostEnvironment::default();
    conn.send(
        SendTarget::Name(well_known.clone()),
        b"hello",
        AttachMask::empty(),
        &host,
        1,
        None,
    )
    .context("send failed")?;

    if args.json {
        let snapshot = subsystem.snapshot();
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("namespace: {} ({})", namespace.devpath(), namespace.id());
        println!("bus: {} (bloom_size={})", bus.name(), bus.bloom_size());
        for (name, owner, waiters) in bus.list_names() {
            println!("  name {name}: owner={owner:?} waiters={waiters}");
        }
    }

    Ok(())
}
