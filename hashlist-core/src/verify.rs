//! Order checks over record files.
//!
//! Used after a run to confirm the output is ascending, and in tests to
//! confirm segments are descending before the merge consumes them.

use crate::error::SortError;
use crate::record::{Key, RECORD_SIZE, Record};
use anyhow::{Result, bail};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Expected key order of a record file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Non-decreasing keys; the final output
    Ascending,
    /// Non-increasing keys; a segment file
    Descending,
}

impl Order {
    fn holds(self, prev: &Key, next: &Key) -> bool {
        match self {
            Order::Ascending => prev <= next,
            Order::Descending => prev >= next,
        }
    }
}

/// Result of [`check_order`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderReport {
    /// Records in the file
    pub records: u64,

    /// Index of the first record out of order with its predecessor
    pub first_violation: Option<u64>,
}

impl OrderReport {
    /// True if every adjacent pair is in order
    pub fn is_sorted(&self) -> bool {
        self.first_violation.is_none()
    }
}

/// Scans `path` and reports whether its records follow `order`.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or mapped, or if its length
/// is not a whole number of records.
pub fn check_order(path: &Path, order: Order) -> Result<OrderReport> {
    let file = File::open(path).map_err(SortError::io(path))?;
    let len = file.metadata().map_err(SortError::io(path))?.len();

    if len % RECORD_SIZE as u64 != 0 {
        bail!("{} is {len} bytes, not a multiple of {RECORD_SIZE}", path.display());
    }
    if len == 0 {
        return Ok(OrderReport { records: 0, first_violation: None });
    }

    // SAFETY: the map is read-only and dropped before returning. Concurrent
    // truncation by another process would be undefined behavior; writers hold
    // an exclusive lock until they finish.
    let mmap = unsafe { Mmap::map(&file).map_err(SortError::io(path))? };

    let mut records = 0u64;
    let mut first_violation = None;
    let mut prev: Option<Key> = None;

    let keys = mmap.chunks_exact(RECORD_SIZE).filter_map(Record::from_slice).map(|r| r.key());
    for key in keys {
        if first_violation.is_none() && prev.is_some_and(|prev| !order.holds(&prev, &key)) {
            first_violation = Some(records);
        }

        prev = Some(key);
        records += 1;
    }

    Ok(OrderReport { records, first_violation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::KEY_OFFSET;
    use tempfile::NamedTempFile;

    fn record_with_key(k: u8) -> [u8; RECORD_SIZE] {
        let mut bytes = [0xaa; RECORD_SIZE];
        bytes[KEY_OFFSET..].fill(0);
        bytes[RECORD_SIZE - 1] = k;
        bytes
    }

    fn file_with_keys(keys: &[u8]) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = keys.iter().flat_map(|&k| record_with_key(k)).collect();
        std::fs::write(file.path(), bytes).unwrap();
        file
    }

    #[test]
    fn test_ascending_file() {
        let file = file_with_keys(&[1, 2, 2, 9]);
        let report = check_order(file.path(), Order::Ascending).unwrap();
        assert_eq!(report, OrderReport { records: 4, first_violation: None });
        assert!(report.is_sorted());
    }

    #[test]
    fn test_first_violation_index() {
        let file = file_with_keys(&[1, 5, 3, 2]);
        let report = check_order(file.path(), Order::Ascending).unwrap();
        assert_eq!(report.first_violation, Some(2));
        assert_eq!(report.records, 4);

        let report = check_order(file.path(), Order::Descending).unwrap();
        assert_eq!(report.first_violation, Some(1));
    }

    #[test]
    fn test_descending_file() {
        let file = file_with_keys(&[9, 9, 4, 0]);
        assert!(check_order(file.path(), Order::Descending).unwrap().is_sorted());
        assert!(!check_order(file.path(), Order::Ascending).unwrap().is_sorted());
    }

    #[test]
    fn test_only_key_bytes_matter() {
        let file = NamedTempFile::new().unwrap();
        let mut first = record_with_key(1);
        first[0] = 0xff;
        let mut second = record_with_key(2);
        second[0] = 0x00;
        std::fs::write(file.path(), [first, second].concat()).unwrap();

        assert!(check_order(file.path(), Order::Ascending).unwrap().is_sorted());
    }

    #[test]
    fn test_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let report = check_order(file.path(), Order::Ascending).unwrap();
        assert_eq!(report.records, 0);
        assert!(report.is_sorted());
    }

    #[test]
    fn test_rejects_partial_record() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [0u8; RECORD_SIZE + 3]).unwrap();
        let err = check_order(file.path(), Order::Ascending).unwrap_err();
        assert!(err.to_string().contains("not a multiple of 16"));
    }

    #[test]
    fn test_missing_file() {
        let err = check_order(Path::new("/nonexistent/list"), Order::Ascending).unwrap_err();
        assert!(matches!(err.downcast_ref::<SortError>(), Some(SortError::Io { .. })));
    }
}
