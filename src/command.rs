//! # Command Decoder
//!
//! Validates and decodes the command kinds whose trailing item streams
//! this crate parses in detail: make-bus, make-namespace, and hello. All
//! three share the same framing: a fixed header (an overall `size` plus,
//! for make-bus, the `flags`/`bloom_size` fields the design notes call
//! out as header fields rather than items) followed by an item stream
//! carrying the rest.
//!
//! The decoder copies nothing beyond what the caller already copied into
//! `buf`; every string and id in the returned command borrows nothing and
//! owns its bytes, so later stages never need to re-touch the original
//! buffer.

use crate::connection::AttachMask;
use crate::error::{Error, Result};
use crate::item::ItemStream;
use crate::types::ItemType;

/// `size` field (u64) + `flags` field (u64) + `bloom_size` field (u64).
pub const MAKE_BUS_HEADER_SIZE: usize = 24;
/// `size` field (u64) only.
pub const MAKE_NAMESPACE_HEADER_SIZE: usize = 8;
/// `size` field (u64) only; conn-name/attach-flags/pool-size all travel
/// as items.
pub const HELLO_HEADER_SIZE: usize = 8;
pub use crate::defaults::MAX_COMMAND_SIZE;

/// A validated, owned make-bus request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeBusCommand {
    pub name: String,
    pub flags: u64,
    pub bloom_size: u32,
    pub cgroup_id: Option<u64>,
}

/// A validated, owned make-namespace request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeNamespaceCommand {
    pub name: String,
}

/// A validated, owned hello request. `conn-name`, `attach-flags`, and
/// `pool-size` are each optional and singleton; absent ones fall back to
/// no label, an empty attach-mask, and [`crate::defaults::POOL_SIZE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloCommand {
    pub label: Option<String>,
    pub attach_mask: AttachMask,
    pub pool_size: u64,
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// Check the declared overall size: at least the fixed header, at most
/// [`MAX_COMMAND_SIZE`], and exactly the length of what the caller copied.
fn validate_declared_size(buf: &[u8], header_size: usize) -> Result<()> {
    if buf.len() < header_size {
        return Err(Error::TooSmall);
    }
    let declared = read_u64(buf, 0) as usize;
    if declared > MAX_COMMAND_SIZE {
        return Err(Error::TooLarge);
    }
    if declared < header_size {
        return Err(Error::TooSmall);
    }
    if declared != buf.len() {
        return Err(Error::InvalidArgument(format!(
            "declared size {declared} does not match buffer length {}",
            buf.len()
        )));
    }
    Ok(())
}

/// A name item's payload is `2..=65` bytes: 1-64 bytes of string content
/// plus a trailing NUL, valid UTF-8.
fn decode_name_payload(payload: &[u8]) -> Result<String> {
    if payload.len() < 2 || payload.len() > 65 {
        return Err(Error::NameTooLong);
    }
    if payload.last() != Some(&0) {
        return Err(Error::InvalidArgument(
            "name item payload is not NUL-terminated".to_string(),
        ));
    }
    let without_nul = &payload[..payload.len() - 1];
    std::str::from_utf8(without_nul)
        .map(str::to_string)
        .map_err(|_| Error::InvalidArgument("name item payload is not valid UTF-8".to_string()))
}

pub fn decode_make_bus(buf: &[u8]) -> Result<MakeBusCommand> {
    validate_declared_size(buf, MAKE_BUS_HEADER_SIZE)?;
    let flags = read_u64(buf, 8);
    let bloom_size = read_u64(buf, 16);
    if bloom_size > u32::MAX as u64 {
        return Err(Error::InvalidArgument(format!(
            "bloom_size {bloom_size} does not fit in 32 bits"
        )));
    }

    let mut name = None;
    let mut cgroup_id = None;

    for item in ItemStream::new(&buf[MAKE_BUS_HEADER_SIZE..]).iter() {
        let item = item?;
        if item.payload.is_empty() {
            return Err(Error::InvalidArgument("item has an empty payload".to_string()));
        }
        let item_type = ItemType::try_from(item.item_type)
            .map_err(|_| Error::NotSupported(format!("unrecognized item type {}", item.item_type)))?;

        match item_type {
            ItemType::MakeName => {
                if name.is_some() {
                    return Err(Error::AlreadyExists);
                }
                name = Some(decode_name_payload(item.payload)?);
            }
            ItemType::MakeCgroup => {
                if cgroup_id.is_some() {
                    return Err(Error::AlreadyExists);
                }
                if item.payload.len() != 8 {
                    return Err(Error::InvalidArgument(
                        "cgroup item payload must be exactly 8 bytes".to_string(),
                    ));
                }
                cgroup_id = Some(read_u64(item.payload, 0));
            }
            _ => {
                return Err(Error::NotSupported(format!(
                    "item type {:?} is not valid in make-bus",
                    item_type
                )))
            }
        }
    }

    let name = name.ok_or_else(|| Error::BadMessage("make-bus requires a name item".to_string()))?;

    Ok(MakeBusCommand {
        name,
        flags,
        bloom_size: bloom_size as u32,
        cgroup_id,
    })
}

pub fn decode_make_namespace(buf: &[u8]) -> Result<MakeNamespaceCommand> {
    validate_declared_size(buf, MAKE_NAMESPACE_HEADER_SIZE)?;

    let mut name = None;
    for item in ItemStream::new(&buf[MAKE_NAMESPACE_HEADER_SIZE..]).iter() {
        let item = item?;
        if item.payload.is_empty() {
            return Err(Error::InvalidArgument("item has an empty payload".to_string()));
        }
        let item_type = ItemType::try_from(item.item_type)
            .map_err(|_| Error::NotSupported(format!("unrecognized item type {}", item.item_type)))?;

        match item_type {
            ItemType::MakeName => {
                if name.is_some() {
                    return Err(Error::AlreadyExists);
                }
                name = Some(decode_name_payload(item.payload)?);
            }
            _ => {
                return Err(Error::NotSupported(format!(
                    "item type {:?} is not valid in make-namespace",
                    item_type
                )))
            }
        }
    }

    let name = name.ok_or_else(|| Error::BadMessage("make-namespace requires a name item".to_string()))?;
    Ok(MakeNamespaceCommand { name })
}

pub fn decode_hello(buf: &[u8]) -> Result<HelloCommand> {
    validate_declared_size(buf, HELLO_HEADER_SIZE)?;

    let mut label = None;
    let mut attach_mask = None;
    let mut pool_size = None;

    for item in ItemStream::new(&buf[HELLO_HEADER_SIZE..]).iter() {
        let item = item?;
        if item.payload.is_empty() {
            return Err(Error::InvalidArgument("item has an empty payload".to_string()));
        }
        let item_type = ItemType::try_from(item.item_type)
            .map_err(|_| Error::NotSupported(format!("unrecognized item type {}", item.item_type)))?;

        match item_type {
            ItemType::ConnName => {
                if label.is_some() {
                    return Err(Error::AlreadyExists);
                }
                label = Some(decode_name_payload(item.payload)?);
            }
            ItemType::AttachFlags => {
                if attach_mask.is_some() {
                    return Err(Error::AlreadyExists);
                }
                if item.payload.len() != 8 {
                    return Err(Error::InvalidArgument(
                        "attach-flags item payload must be exactly 8 bytes".to_string(),
                    ));
                }
                attach_mask = Some(AttachMask::from_bits_truncate(read_u64(item.payload, 0)));
            }
            ItemType::PoolSize => {
                if pool_size.is_some() {
                    return Err(Error::AlreadyExists);
                }
                if item.payload.len() != 8 {
                    return Err(Error::InvalidArgument(
                        "pool-size item payload must be exactly 8 bytes".to_string(),
                    ));
                }
                let requested = read_u64(item.payload, 0);
                if requested > crate::defaults::POOL_SIZE {
                    return Err(Error::TooLarge);
                }
                pool_size = Some(requested);
            }
            _ => {
                return Err(Error::NotSupported(format!(
                    "item type {:?} is not valid in hello",
                    item_type
                )))
            }
        }
    }

    Ok(HelloCommand {
        label,
        attach_mask: attach_mask.unwrap_or_else(AttachMask::empty),
        pool_size: pool_size.unwrap_or(crate::defaults::POOL_SIZE),
    })
}
