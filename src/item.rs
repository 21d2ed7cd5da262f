//! # Item-Stream Codec
//!
//! The common TLV-like record format shared by every command and every
//! message: a sequence of 8-byte-aligned `{size, type, payload}` records.
//! `size` includes the 16-byte header; the payload is padded up to the next
//! multiple of 8 so the following item starts aligned.
//!
//! Decoding validates framing but never copies payloads — callers receive
//! bounded slices into the caller-owned buffer. Encoding appends into a
//! buffer that grows by power-of-two doubling, starting at 256 bytes.
//!
//! Emptiness of a payload is not an intrinsic framing violation: it is
//! illegal for command items (checked by the command decoder,
//! `crate::command`) and legal for placeholder payload records used
//! elsewhere, signaled by `PLACEHOLDER_OFFSET` ("pad only", no real data).

use crate::error::{Error, Result};

/// Size of the fixed `{size, type}` header preceding every item's payload.
pub const ITEM_HEADER_SIZE: usize = 16;

/// Initial capacity of a freshly created [`ItemBuilder`].
pub const INITIAL_BUILDER_CAPACITY: usize = 256;

/// Sentinel payload offset meaning "this payload region carries no data,
/// it exists only to hold the item's padding."
pub const PLACEHOLDER_OFFSET: u64 = u64::MAX;

/// Round `n` up to the next multiple of 8.
pub const fn pad8(n: usize) -> usize {
    (n + 7) & !7
}

/// A single decoded item: a type code and a bounded payload slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemView<'a> {
    pub item_type: u64,
    pub payload: &'a [u8],
}

/// A validated, bounds-checked view over an item stream.
///
/// Construction does not itself walk the stream; call [`ItemStream::iter`]
/// to get an iterator that performs the bounds checks item by item, or
/// [`ItemStream::validate`] to eagerly walk the whole stream once.
#[derive(Debug, Clone, Copy)]
pub struct ItemStream<'a> {
    buf: &'a [u8],
}

impl<'a> ItemStream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Iterate the stream's items in order.
    pub fn iter(&self) -> ItemIter<'a> {
        ItemIter {
            buf: self.buf,
            offset: 0,
            done: false,
        }
    }

    /// Walk every item, returning `Ok(())` iff the whole stream is
    /// well-formed and the residual padding at the end is `< 8` bytes.
    pub fn validate(&self) -> Result<()> {
        for item in self.iter() {
            item?;
        }
        Ok(())
    }
}

/// Iterator over the items of an [`ItemStream`].
///
/// Yields `Err` and stops permanently the first time a record violates
/// framing: a declared size below the header size, or an item whose
/// padded extent would cross the buffer end.
pub struct ItemIter<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = Result<ItemView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let remaining = self.buf.len() - self.offset;
        if remaining < ITEM_HEADER_SIZE {
            self.done = true;
            if remaining >= 8 {
                return Some(Err(Error::InvalidArgument(format!(
                    "stream has {remaining} residual bytes at offset {}, expected < 8",
                    self.offset
                ))));
            }
            return None;
        }

        let header = &self.buf[self.offset..self.offset + ITEM_HEADER_SIZE];
        let size = u64::from_le_bytes(header[0..8].try_into().unwrap()) as usize;
        let item_type = u64::from_le_bytes(header[8..16].try_into().unwrap());

        if size < ITEM_HEADER_SIZE {
            self.done = true;
            return Some(Err(Error::InvalidArgument(format!(
                "item size {size} smaller than header size {ITEM_HEADER_SIZE}"
            ))));
        }

        let padded = pad8(size);
        if self.offset + padded > self.buf.len() {
            self.done = true;
            return Some(Err(Error::InvalidArgument(format!(
                "item at offset {} of padded size {} crosses buffer end {}",
                self.offset,
                padded,
                self.buf.len()
            ))));
        }

        let payload = &self.buf[self.offset + ITEM_HEADER_SIZE..self.offset + size];
        self.offset += padded;
        Some(Ok(ItemView { item_type, payload }))
    }
}

/// A growable, append-only item-stream builder.
///
/// Doubles capacity starting from [`INITIAL_BUILDER_CAPACITY`]; never
/// shrinks. The entire metadata or message buffer is addressable as one
/// contiguous item stream at any point — linked chunks would break that
/// contract, so this is the only encoder this crate has.
pub struct ItemBuilder {
    buf: Vec<u8>,
}

impl ItemBuilder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_BUILDER_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn grow_for(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        let mut cap = self.buf.capacity().max(INITIAL_BUILDER_CAPACITY);
        while cap < needed {
            cap *= 2;
        }
        if cap > self.buf.capacity() {
            self.buf.reserve(cap - self.buf.len());
        }
    }

    /// Append an item with the given payload bytes, padding to the next
    /// multiple of 8. Rejects an empty payload (use
    /// [`ItemBuilder::push_placeholder`] for a deliberately empty,
    /// pad-only record).
    pub fn push_item(&mut self, item_type: u64, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::InvalidArgument(
                "command items may not have an empty payload".to_string(),
            ));
        }
        self.push_raw(item_type, payload)
    }

    /// Append a zero-length "pad only" placeholder record, signaled to
    /// readers by [`PLACEHOLDER_OFFSET`].
    pub fn push_placeholder(&mut self, item_type: u64) -> Result<()> {
        self.push_raw(item_type, &[])
    }

    fn push_raw(&mut self, item_type: u64, payload: &[u8]) -> Result<()> {
        let size = ITEM_HEADER_SIZE + payload.len();
        let padded = pad8(size);
        self.grow_for(padded);

        self.buf.extend_from_slice(&(size as u64).to_le_bytes());
        self.buf.extend_from_slice(&item_type.to_le_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(self.buf.len() + (padded - size), 0);
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for ItemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_item() {
        let mut b = ItemBuilder::new();
        b.push_item(7, b"hello").unwrap();
        let bytes = b.finish();

        let stream = ItemStream::new(&bytes);
        let items: Vec<_> = stream.iter().collect::<Result<_>>().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_type, 7);
        assert_eq!(items[0].payload, b"hello");
    }

    #[test]
    fn round_trips_multiple_items_back_to_back() {
        let mut b = ItemBuilder::new();
        b.push_item(1, b"a").unwrap();
        b.push_item(2, b"bcdefgh").unwrap();
        b.push_item(3, &[9u8; 100]).unwrap();
        let bytes = b.finish();

        let items: Vec<_> = ItemStream::new(&bytes)
            .iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].payload, b"a");
        assert_eq!(items[1].payload, b"bcdefgh");
        assert_eq!(items[2].payload, &[9u8; 100][..]);
    }

    #[test]
    fn residual_padding_is_always_under_8_bytes() {
        let mut b = ItemBuilder::new();
        for i in 0..20u64 {
            b.push_item(i, &vec![i as u8; (i as usize % 13) + 1])
                .unwrap();
        }
        let bytes = b.finish();
        let mut offset = 0usize;
        for item in ItemStream::new(&bytes).iter() {
            let item = item.unwrap();
            offset += pad8(ITEM_HEADER_SIZE + item.payload.len());
        }
        let residual = bytes.len() - offset;
        assert!(residual < 8, "residual {residual} not < 8");
    }

    #[test]
    fn rejects_size_below_header() {
        let mut bytes = vec![0u8; 16];
        bytes[0..8].copy_from_slice(&8u64.to_le_bytes()); // size 8 < 16
        let err = ItemStream::new(&bytes).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn rejects_item_crossing_buffer_end() {
        let mut bytes = vec![0u8; 16];
        bytes[0..8].copy_from_slice(&64u64.to_le_bytes()); // size 64 > buffer
        let err = ItemStream::new(&bytes).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn rejects_excess_trailing_bytes() {
        let mut b = ItemBuilder::new();
        b.push_item(1, b"x").unwrap();
        let mut bytes = b.finish();
        bytes.extend_from_slice(&[0u8; 8]); // a full extra header-sized gap
        let err = ItemStream::new(&bytes).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn placeholder_item_has_empty_payload() {
        let mut b = ItemBuilder::new();
        b.push_placeholder(42).unwrap();
        let bytes = b.finish();
        let items: Vec<_> = ItemStream::new(&bytes)
            .iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].payload.is_empty());
    }

    #[test]
    fn builder_doubles_capacity_from_256() {
        let b = ItemBuilder::new();
        assert!(b.buf.capacity() >= INITIAL_BUILDER_CAPACITY);
    }
}
