//! Binary record builder (C1): compose a map or array of a priori unknown
//! size into the widest msgpack header form without a second pass.
//!
//! The header is always emitted as the 32-bit-length family (`map 32` /
//! `array 32`) so closing a container is an in-place 4-byte store,
//! regardless of the final entry count. See `flb_mp_map_header_init` /
//! `flb_mp_map_header_append` / `flb_mp_map_header_end` in the grounding
//! source for the msgpack-c version of this trick.

use crate::Error;

const MAP32: u8 = 0xdf;
const ARRAY32: u8 = 0xdd;
const HEADER_LEN: usize = 5; // 1 tag byte + 4-byte big-endian count

fn open(writer: &mut Vec<u8>, tag: u8) -> usize {
    let offset = writer.len();
    writer.push(tag);
    writer.extend_from_slice(&[0u8; 4]);
    offset
}

fn close(writer: &mut [u8], offset: usize, entries: u64) -> Result<(), Error> {
    let count = u32::try_from(entries).map_err(|_| Error::Overflow)?;
    writer[offset + 1..offset + HEADER_LEN].copy_from_slice(&count.to_be_bytes());
    Ok(())
}

/// Cursor for an in-progress map header (`MapHeader` in the data model).
#[derive(Debug)]
pub struct MapHeader {
    offset: usize,
    entries: u64,
    #[cfg(debug_assertions)]
    raw_writes: u64,
}

impl MapHeader {
    /// Emits a map header at the widest encoding and starts tracking it.
    pub fn open(writer: &mut Vec<u8>) -> Self {
        Self {
            offset: open(writer, MAP32),
            entries: 0,
            #[cfg(debug_assertions)]
            raw_writes: 0,
        }
    }

    /// Registers one key/value pair. The caller is then obliged to push
    /// exactly one key object followed by one value object into the writer
    /// (see [`Self::record_write`]).
    pub fn entry(&mut self) -> u64 {
        self.entries += 1;
        self.entries
    }

    /// Call once per raw key or value object actually pushed into the
    /// writer. Only used to catch, in debug builds, a caller that closes a
    /// map after writing an odd number of objects for its registered
    /// entries.
    pub fn record_write(&mut self) {
        #[cfg(debug_assertions)]
        {
            self.raw_writes += 1;
        }
    }

    /// Overwrites the header with the final entry count. Does not move any
    /// other byte in `writer`.
    pub fn close(self, writer: &mut Vec<u8>) -> Result<(), Error> {
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            self.raw_writes,
            self.entries * 2,
            "map_close: odd number of key/value writes for {} entries",
            self.entries
        );
        close(writer, self.offset, self.entries)
    }

    /// Number of entries registered so far.
    pub fn len(&self) -> u64 {
        self.entries
    }

    /// True if no entry has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

/// Cursor for an in-progress array header.
#[derive(Debug)]
pub struct ArrayHeader {
    offset: usize,
    entries: u64,
    #[cfg(debug_assertions)]
    raw_writes: u64,
}

impl ArrayHeader {
    /// Emits an array header at the widest encoding and starts tracking it.
    pub fn open(writer: &mut Vec<u8>) -> Self {
        Self {
            offset: open(writer, ARRAY32),
            entries: 0,
            #[cfg(debug_assertions)]
            raw_writes: 0,
        }
    }

    /// Registers one element. The caller must then push exactly one value
    /// object into the writer.
    pub fn entry(&mut self) -> u64 {
        self.entries += 1;
        self.entries
    }

    /// Call once per raw value object pushed into the writer.
    pub fn record_write(&mut self) {
        #[cfg(debug_assertions)]
        {
            self.raw_writes += 1;
        }
    }

    /// Overwrites the header with the final entry count.
    pub fn close(self, writer: &mut Vec<u8>) -> Result<(), Error> {
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            self.raw_writes, self.entries,
            "array_close: entry/write count mismatch ({} entries, {} writes)",
            self.entries, self.raw_writes
        );
        close(writer, self.offset, self.entries)
    }

    /// Number of entries registered so far.
    pub fn len(&self) -> u64 {
        self.entries
    }

    /// True if no entry has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}
