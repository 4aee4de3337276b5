//! Block generation: one memory buffer of records, hashed in parallel,
//! sorted descending, then written to disk as a segment.
//!
//! A [`Block`] owns its buffer exclusively. [`Block::persist`] consumes the
//! block, so the buffer cannot be read or reused once it has been written.

use crate::error::SortError;
use crate::partition::split_even;
use crate::record::{RECORD_SIZE, Record, RecordCodec};
use crate::segment::Segment;
use crate::sort::sort_descending;
use anyhow::{Context, Result};
use rayon::ThreadPool;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Write buffer used when persisting a block
const PERSIST_BUFFER_SIZE: usize = 1 << 20;

/// Generates and sorts blocks on a fixed-size thread pool
#[derive(Debug)]
pub struct BlockBuilder {
    pool: ThreadPool,
    workers: usize,
}

impl BlockBuilder {
    /// Creates a builder whose generation and sort use `threads` threads
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `threads` is zero, or an error if the
    /// thread pool cannot be started.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(SortError::config("thread count must be >= 1").into());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("hashlist-block-{i}"))
            .build()
            .context("Failed to build block thread pool")?;

        Ok(Self { pool, workers: threads })
    }

    /// Encodes every ID in `first_id..=last_id` into a new block.
    ///
    /// The range is split into `workers` contiguous sub-ranges (the last one
    /// takes the remainder); each worker writes only its own slice of the
    /// shared buffer. Workers with an empty sub-range do nothing.
    ///
    /// # Errors
    ///
    /// - `SortError::Configuration` if the range is inverted or its buffer
    ///   would not be addressable on this platform
    /// - The first codec failure reported by any worker; no partial block is
    ///   returned
    pub fn generate<C: RecordCodec>(
        &self,
        block_id: usize,
        first_id: u64,
        last_id: u64,
        codec: &C,
    ) -> Result<Block> {
        let len = block_len(first_id, last_id)?;
        let mut records = vec![Record::default(); len];

        let mut work = Vec::with_capacity(self.workers);
        let mut rest: &mut [Record] = &mut records;
        for range in split_even(len, self.workers) {
            let (slots, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
            work.push((first_id + range.start as u64, slots));
            rest = tail;
        }

        self.pool.install(|| {
            work.into_par_iter()
                .try_for_each(|(first, slots)| encode_into(codec, first, slots))
        })?;

        Ok(Block { id: block_id, first_id, last_id, records, sorted: false })
    }

    /// Sorts the block in place, largest key first
    pub fn sort(&self, block: &mut Block) {
        sort_descending(&mut block.records, &self.pool);
        block.sorted = true;
    }
}

/// Records of one ID sub-range, held in memory until persisted
#[derive(Debug)]
pub struct Block {
    id: usize,
    first_id: u64,
    last_id: u64,
    records: Vec<Record>,
    sorted: bool,
}

impl Block {
    /// Block index assigned by the planner
    pub fn id(&self) -> usize {
        self.id
    }

    /// Inclusive ID range covered by this block
    pub fn id_range(&self) -> (u64, u64) {
        (self.first_id, self.last_id)
    }

    /// Number of records in the block
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the block holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns true once the block has been sorted
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Records in their current order
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Writes the records verbatim to a new file at `path` and releases the
    /// buffer.
    ///
    /// # Errors
    ///
    /// Returns `SortError::Io` if the file cannot be created or written.
    pub fn persist(self, path: &Path) -> Result<Segment> {
        if !self.sorted {
            log::warn!("Persisting block {} before it was sorted", self.id);
        }

        let file = File::create(path).map_err(SortError::io(path))?;
        let mut out = BufWriter::with_capacity(PERSIST_BUFFER_SIZE, file);
        for record in &self.records {
            out.write_all(record.as_bytes()).map_err(SortError::io(path))?;
        }
        out.flush().map_err(SortError::io(path))?;

        log::debug!(
            "Block {} persisted to {} ({} records)",
            self.id,
            path.display(),
            self.records.len()
        );

        Ok(Segment::new(self.id, path.to_path_buf(), self.records.len() as u64))
    }
}

/// Number of records in `first_id..=last_id`, checked against addressable memory
fn block_len(first_id: u64, last_id: u64) -> Result<usize> {
    if first_id > last_id {
        return Err(SortError::config(format!(
            "inverted block range {first_id:#x}..={last_id:#x}"
        ))
        .into());
    }

    let count = (last_id - first_id)
        .checked_add(1)
        .ok_or_else(|| SortError::config("block range covers the entire u64 domain"))?;

    let len = usize::try_from(count)
        .ok()
        .filter(|len| len.checked_mul(RECORD_SIZE).is_some_and(|b| b <= isize::MAX as usize))
        .ok_or_else(|| {
            SortError::config(format!("block of {count} records exceeds addressable memory"))
        })?;

    Ok(len)
}

fn encode_into<C: RecordCodec>(codec: &C, first: u64, slots: &mut [Record]) -> Result<()> {
    for (offset, slot) in slots.iter_mut().enumerate() {
        *slot = codec.encode(first + offset as u64)?;
    }
    Ok(())
}
