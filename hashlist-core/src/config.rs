//! Run configuration and its eager validation.

use crate::error::SortError;
use crate::record::RECORD_SIZE;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// Default number of worker threads
pub const DEFAULT_THREADS: usize = 8;

/// Default byte budget per block, the largest buffer a 32-bit length can address
pub const DEFAULT_MEMORY_BUDGET: u64 = i32::MAX as u64;

/// Default number of written records between progress messages
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10_000_000;

/// Default capacity of the final merge queue, in records
pub const DEFAULT_QUEUE_CAPACITY: usize = 1 << 14;

/// Parameters of one sort run
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// First ID to generate (inclusive)
    pub start: u64,

    /// Last ID to generate (inclusive)
    pub end: u64,

    /// Threads for generation, sorting and merge lanes
    pub threads: usize,

    /// Bytes of records held in memory per block, and shared by the segment
    /// read-ahead buffers during the merge
    pub memory_budget: u64,

    /// Final ascending output file
    pub output: PathBuf,

    /// Prefix for segment files; defaults to the output path
    pub segment_prefix: Option<PathBuf>,

    /// Written records between progress messages
    pub progress_interval: u64,

    /// Capacity of the final merge queue; lane queues share it evenly
    pub queue_capacity: usize,
}

impl SortConfig {
    /// Configuration for `start..=end` written to `output`, with defaults for
    /// everything else
    pub fn new(start: u64, end: u64, output: impl Into<PathBuf>) -> Self {
        Self {
            start,
            end,
            threads: DEFAULT_THREADS,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            output: output.into(),
            segment_prefix: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Sets the thread count
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the memory budget in bytes
    #[must_use]
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Sets the segment file prefix
    #[must_use]
    pub fn with_segment_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.segment_prefix = Some(prefix.into());
        self
    }

    /// Sets the progress interval
    #[must_use]
    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Sets the final queue capacity
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Checks every parameter before any work starts
    ///
    /// # Errors
    ///
    /// Returns `SortError::Configuration` if:
    /// - the ID range is inverted or spans the entire `u64` domain
    /// - the thread count is zero
    /// - the memory budget floors to zero records
    /// - the largest block would not be addressable on this platform
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(SortError::config("thread count must be >= 1").into());
        }

        let records = self.record_count()?;
        let per_block = self.records_per_block()?;

        let largest = per_block.min(records);
        let addressable = usize::try_from(largest)
            .ok()
            .and_then(|n| n.checked_mul(RECORD_SIZE))
            .is_some_and(|bytes| bytes <= isize::MAX as usize);
        if !addressable {
            return Err(SortError::config(format!(
                "a block of {largest} records exceeds the addressable buffer size"
            ))
            .into());
        }

        Ok(())
    }

    /// Number of IDs in the configured range
    ///
    /// # Errors
    ///
    /// Returns `SortError::Configuration` for an inverted range or one whose
    /// size does not fit in a `u64`.
    pub fn record_count(&self) -> Result<u64> {
        if self.start > self.end {
            return Err(SortError::config(format!(
                "start {:#x} is after end {:#x}",
                self.start, self.end
            ))
            .into());
        }

        (self.end - self.start)
            .checked_add(1)
            .ok_or_else(|| SortError::config("ID range covers the entire u64 domain").into())
    }

    /// Records that fit in one block: the budget floored to whole records
    ///
    /// # Errors
    ///
    /// Returns `SortError::Configuration` if the budget is smaller than one
    /// record.
    pub fn records_per_block(&self) -> Result<u64> {
        let per_block = self.memory_budget / RECORD_SIZE as u64;
        if per_block == 0 {
            return Err(SortError::config(format!(
                "memory budget of {} bytes floors to 0 records of {RECORD_SIZE} bytes",
                self.memory_budget
            ))
            .into());
        }
        Ok(per_block)
    }

    /// Prefix segment file names are derived from
    pub fn segment_prefix(&self) -> &Path {
        self.segment_prefix.as_deref().unwrap_or(&self.output)
    }

    /// Read-ahead bytes for each of `segments` readers during the merge
    pub fn read_ahead_bytes(&self, segments: usize) -> usize {
        let share = self.memory_budget / segments.max(1) as u64;
        usize::try_from(share).unwrap_or(usize::MAX)
    }

    /// Merge lanes used for `segments` segments
    pub fn lane_count(&self, segments: usize) -> usize {
        self.threads.min(segments)
    }

    /// Interval between progress messages, at least one record
    pub fn effective_progress_interval(&self) -> u64 {
        self.progress_interval.max(1)
    }
}
