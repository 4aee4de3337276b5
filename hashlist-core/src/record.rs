//! Fixed-width hash records and the codec that produces them.
//!
//! Every record is exactly [`RECORD_SIZE`] bytes. Ordering only looks at the
//! trailing [`KEY_LEN`] bytes, compared as unsigned bytes, so two records with
//! the same key are equal for sorting even when their leading bytes differ.

use anyhow::Result;
use md5::{Digest, Md5};
use std::fmt;

/// Size of one record on disk and in memory (one MD5 digest)
pub const RECORD_SIZE: usize = 16;

/// Offset of the comparison key inside a record
pub const KEY_OFFSET: usize = 10;

/// Length of the comparison key (the last 12 hex chars of the digest)
pub const KEY_LEN: usize = RECORD_SIZE - KEY_OFFSET;

/// Number of hex digits an ID is padded to before hashing
const HEX_WIDTH: usize = RECORD_SIZE;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Comparison key of a record. Arrays compare lexicographically as `u8`.
pub type Key = [u8; KEY_LEN];

/// One 16-byte record
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Record([u8; RECORD_SIZE]);

impl Record {
    /// Wraps raw bytes as a record
    #[inline]
    pub const fn new(bytes: [u8; RECORD_SIZE]) -> Self {
        Self(bytes)
    }

    /// Reads a record from the first `RECORD_SIZE` bytes of `bytes`.
    ///
    /// Returns `None` if the slice is too short.
    #[inline]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let head = bytes.get(..RECORD_SIZE)?;
        let mut record = [0u8; RECORD_SIZE];
        record.copy_from_slice(head);
        Some(Self(record))
    }

    /// The comparison key (bytes 10..16)
    #[inline]
    pub fn key(&self) -> Key {
        let [.., k0, k1, k2, k3, k4, k5] = self.0;
        [k0, k1, k2, k3, k4, k5]
    }

    /// Raw bytes of the record
    #[inline]
    pub fn as_bytes(&self) -> &[u8; RECORD_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl From<[u8; RECORD_SIZE]> for Record {
    fn from(bytes: [u8; RECORD_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Deterministic mapping from an ordinal ID to its record.
///
/// Implementations must be pure: the same ID always yields the same record.
/// They are shared across generation workers, hence `Sync`.
pub trait RecordCodec: Sync {
    /// Produces the record for `id`
    ///
    /// # Errors
    ///
    /// Returns an error (typically `SortError::Codec`) if the record cannot
    /// be computed. The failure aborts the block being generated.
    fn encode(&self, id: u64) -> Result<Record>;
}

/// MD5 of the ID written as 16 lowercase, zero-padded hex digits plus `\n`
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5HexCodec;

impl Md5HexCodec {
    /// The text that gets hashed for `id`
    pub fn hex_line(id: u64) -> [u8; HEX_WIDTH + 1] {
        let mut line = [b'\n'; HEX_WIDTH + 1];
        for (i, slot) in line.iter_mut().take(HEX_WIDTH).enumerate() {
            let shift = (HEX_WIDTH - 1 - i) * 4;
            let nibble = (id >> shift) & 0xf;
            *slot = HEX_DIGITS[nibble as usize];
        }
        line
    }
}

impl RecordCodec for Md5HexCodec {
    #[inline]
    fn encode(&self, id: u64) -> Result<Record> {
        let digest = Md5::digest(Self::hex_line(id));
        let mut record = [0u8; RECORD_SIZE];
        record.copy_from_slice(&digest);
        Ok(Record(record))
    }
}
