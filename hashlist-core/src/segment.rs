//! On-disk segments and the destructive reader that drains them.
//!
//! A segment is a raw concatenation of records sorted descending by key, with
//! no header. [`SegmentReader`] reads it from the tail towards the head, so
//! records come out in ascending order, and truncates each chunk off the file
//! as soon as it is buffered.
//!
//! # Crash Safety
//!
//! There is none. Truncation happens before the buffered records are merged
//! or written anywhere else; if the process dies mid-merge those records are
//! gone. At every point the bytes left on disk are a multiple of
//! [`RECORD_SIZE`] and are exactly the smallest not-yet-buffered records, still
//! in descending order.

use crate::error::SortError;
use crate::record::{RECORD_SIZE, Record};
use anyhow::{Context, Result, bail};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Descriptor of one persisted, descending-sorted run of records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    id: usize,
    path: PathBuf,
    records: u64,
}

impl Segment {
    /// Describes the segment with planner index `id` stored at `path`
    pub fn new(id: usize, path: PathBuf, records: u64) -> Self {
        Self { id, path, records }
    }

    /// Planner-assigned block index
    pub fn id(&self) -> usize {
        self.id
    }

    /// Location of the segment file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records written when the segment was created
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Checks the file holds exactly the records it was written with and
    /// returns its length in bytes. Reads nothing and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns `SortError::Io` if the file cannot be inspected, or an error if
    /// its length differs from `records * RECORD_SIZE`.
    pub fn check_on_disk(&self) -> Result<u64> {
        let file_len = fs::metadata(&self.path).map_err(SortError::io(&self.path))?.len();
        let expected = self.records * RECORD_SIZE as u64;
        if file_len != expected {
            bail!(
                "Segment {} is {file_len} bytes, expected {expected} for {} records",
                self.path.display(),
                self.records
            );
        }
        Ok(file_len)
    }

    /// Segment file name for block `id`: the prefix with the index appended
    pub fn path_for(prefix: &Path, id: usize) -> PathBuf {
        let mut name = prefix.as_os_str().to_owned();
        name.push(id.to_string());
        PathBuf::from(name)
    }
}

/// Something that yields records in ascending key order, one pull at a time.
///
/// `Ok(None)` means the source is drained; errors are reserved for real
/// failures. Once drained a source keeps returning `Ok(None)`.
pub trait RecordSource: Send {
    /// Returns the next record, or `None` when the source is drained
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn pull(&mut self) -> Result<Option<Record>>;
}

/// Drains one segment file back to front, truncating as it goes.
///
/// No file handle is kept between refills: each refill opens the file, takes
/// an exclusive lock, reads and truncates the tail, and closes it again. A
/// merge over thousands of segments therefore holds at most one descriptor
/// per lane at a time. A segment must have exactly one reader; the lock only
/// catches a second reader that refills at the same moment.
#[derive(Debug)]
pub struct SegmentReader {
    path: PathBuf,

    buffer: Vec<u8>,

    /// Offset of the next record to hand out
    position: usize,

    /// End of the unconsumed window; zero means the window is empty
    limit: usize,

    /// No bytes remain on disk
    exhausted: bool,
}

impl SegmentReader {
    /// Opens `segment` with a read-ahead buffer of at most `buffer_bytes`.
    ///
    /// The capacity is floored to a multiple of [`RECORD_SIZE`], raised to at
    /// least one record and capped at the file length. The first chunk is read
    /// (and truncated off disk) immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, if its length is not a
    /// multiple of the record size, or if the first refill fails.
    pub fn open(segment: &Segment, buffer_bytes: usize) -> Result<Self> {
        let file_len = segment.check_on_disk()?;

        let mut reader = Self {
            path: segment.path().to_path_buf(),
            buffer: vec![0u8; read_ahead_capacity(buffer_bytes, file_len)],
            position: 0,
            limit: 0,
            exhausted: false,
        };
        reader.refill()?;
        Ok(reader)
    }

    /// Capacity of the read-ahead buffer in bytes
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true once nothing is left on disk or in the buffer
    pub fn is_drained(&self) -> bool {
        self.exhausted && self.limit == 0
    }

    /// Buffers the last chunk of the file and truncates it off disk.
    fn refill(&mut self) -> Result<()> {
        if self.exhausted {
            self.position = 0;
            self.limit = 0;
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(SortError::io(&self.path))?;

        file.try_lock_exclusive()
            .with_context(|| format!("Segment {} is already being read", self.path.display()))?;

        let file_len = file.metadata().map_err(SortError::io(&self.path))?.len();
        if file_len % RECORD_SIZE as u64 != 0 {
            bail!(
                "Segment {} is {file_len} bytes, not a multiple of the {RECORD_SIZE}-byte record size",
                self.path.display()
            );
        }

        let to_read = usize::try_from(file_len)
            .map_or(self.buffer.len(), |len| len.min(self.buffer.len()));
        if to_read as u64 == file_len {
            self.exhausted = true;
        }

        let keep = file_len - to_read as u64;
        file.seek(SeekFrom::Start(keep)).map_err(SortError::io(&self.path))?;
        file.read_exact(&mut self.buffer[..to_read]).map_err(SortError::io(&self.path))?;

        // Destructive: from here on the chunk only exists in memory
        file.set_len(keep).map_err(SortError::io(&self.path))?;
        drop(file);

        if to_read == 0 {
            self.position = 0;
            self.limit = 0;
        } else {
            self.position = to_read - RECORD_SIZE;
            self.limit = to_read;
        }

        log::debug!(
            "Refilled {} bytes from {} ({} bytes left on disk)",
            to_read,
            self.path.display(),
            keep
        );

        if self.exhausted {
            fs::remove_file(&self.path).map_err(SortError::io(&self.path))?;
        }

        Ok(())
    }
}

impl RecordSource for SegmentReader {
    fn pull(&mut self) -> Result<Option<Record>> {
        if self.is_drained() {
            return Ok(None);
        }

        let record = Record::from_slice(&self.buffer[self.position..self.limit])
            .context("Segment window holds less than one record")?;

        if self.position == 0 {
            self.refill()?;
        } else {
            self.position -= RECORD_SIZE;
            self.limit -= RECORD_SIZE;
        }

        Ok(Some(record))
    }
}

/// Read-ahead size for a segment of `file_len` bytes given a byte budget
pub fn read_ahead_capacity(buffer_bytes: usize, file_len: u64) -> usize {
    let floored = (buffer_bytes - buffer_bytes % RECORD_SIZE).max(RECORD_SIZE);
    usize::try_from(file_len).map_or(floored, |len| floored.min(len))
}
