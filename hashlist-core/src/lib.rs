//! Hashlist - External sort of generated hash records
//!
//! Hashlist generates one 16-byte record for every ID of a contiguous range
//! and writes all of them to a single file sorted ascending by the record's
//! last six bytes. The range may be far larger than memory: records are built
//! and sorted in memory-sized blocks, spilled to disk as descending segments,
//! then merged back into one ascending stream.
//!
//! # Features
//!
//! - Parallel generation and sorting inside each block (rayon)
//! - Two-level k-way merge over bounded queues (crossbeam)
//! - Segments are truncated as they are read, so disk usage never exceeds
//!   the unread remainder
//! - Pluggable record codec; MD5 of the zero-padded hex ID by default
//!
//! # Example
//!
//! ```no_run
//! use hashlist_core::{ExternalSort, SortConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = SortConfig::new(0, 0xffff_ffff, "list")
//!     .with_threads(8)
//!     .with_memory_budget(1 << 30);
//!
//! let summary = ExternalSort::new(config)?.run()?;
//! println!("{} records in {} blocks", summary.records, summary.blocks);
//! # Ok(())
//! # }
//! ```
//!
//! # Crash Safety
//!
//! There is none. A failure during the merge permanently loses whatever part
//! of the segments was already truncated. Rerun from scratch.

pub mod block;
pub mod config;
pub mod error;
pub mod merge;
pub mod planner;
pub mod progress;
pub mod record;
pub mod segment;
pub mod verify;
pub mod writer;

#[cfg(feature = "internals")]
pub mod partition;
#[cfg(not(feature = "internals"))]
pub(crate) mod partition;

#[cfg(feature = "internals")]
pub mod sort;
#[cfg(not(feature = "internals"))]
pub(crate) mod sort;

pub use config::SortConfig;
pub use error::SortError;
pub use merge::{MergeEngine, MergeStream, Message};
pub use progress::ProgressTracker;
pub use record::{Key, Md5HexCodec, RECORD_SIZE, Record, RecordCodec};
pub use segment::{RecordSource, Segment, SegmentReader};
pub use verify::{Order, OrderReport, check_order};
pub use writer::OutputWriter;

use anyhow::{Result, bail};
use log::info;
use std::fs::File;
use std::time::{Duration, Instant};

/// Outcome of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Blocks generated, equal to the number of segments merged
    pub blocks: usize,

    /// Records written to the output
    pub records: u64,

    /// Wall time of the whole run
    pub elapsed: Duration,
}

/// Public facade driving a full sort run
///
/// Validates the configuration, builds every block into a segment, then
/// merges the segments into the output file.
#[derive(Debug)]
pub struct ExternalSort<C: RecordCodec = Md5HexCodec> {
    config: SortConfig,
    codec: C,
}

impl ExternalSort<Md5HexCodec> {
    /// Creates a run using the default MD5 codec
    ///
    /// # Errors
    ///
    /// Returns `SortError::Configuration` if `config` is invalid.
    pub fn new(config: SortConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, codec: Md5HexCodec })
    }
}

impl<C: RecordCodec> ExternalSort<C> {
    /// Replaces the record codec
    #[must_use]
    pub fn with_codec<D: RecordCodec>(self, codec: D) -> ExternalSort<D> {
        ExternalSort { config: self.config, codec }
    }

    /// Configuration of this run
    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Generates, sorts and persists every block
    ///
    /// # Errors
    ///
    /// Returns the first codec or I/O failure. Segments already written are
    /// left on disk.
    pub fn build_segments(&self) -> Result<Vec<Segment>> {
        planner::plan_blocks(&self.config, &self.codec)
    }

    /// Merges `segments` into the output file, consuming them.
    ///
    /// Every segment file is deleted once fully read. Returns the number of
    /// records appended to the output.
    ///
    /// # Errors
    ///
    /// Returns the first read, merge or write failure, or an error if the
    /// written count differs from the segments' total.
    pub fn merge_segments(&self, segments: Vec<Segment>) -> Result<u64> {
        let expected: u64 = segments.iter().map(Segment::records).sum();
        let read_ahead = self.config.read_ahead_bytes(segments.len());

        let mut writer = OutputWriter::open(&self.config.output)?;

        // Opening a reader truncates its first chunk, so reject damaged or
        // missing segments before any of them is touched
        for segment in &segments {
            segment.check_on_disk()?;
        }

        let readers = segments
            .iter()
            .map(|segment| SegmentReader::open(segment, read_ahead))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Merging {} segments over {} lanes",
            readers.len(),
            self.config.lane_count(readers.len())
        );

        let mut stream =
            MergeEngine::new(self.config.threads, self.config.queue_capacity).start(readers)?;

        let progress = ProgressTracker::new("Records written:")
            .with_interval(self.config.effective_progress_interval());

        writer.drain(&mut stream, &progress)?;
        progress.log_final();

        let written = writer.finish()?;
        if written != expected {
            bail!("Merge wrote {written} records, expected {expected}");
        }
        Ok(written)
    }

    /// Runs the whole sort: truncates the output, builds segments, merges.
    ///
    /// # Errors
    ///
    /// Returns `SortError::Configuration` before any file is touched if the
    /// configuration is invalid, otherwise the first failure of any phase.
    pub fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        self.config.validate()?;

        File::create(&self.config.output).map_err(SortError::io(&self.config.output))?;

        info!(
            "Sorting {:#x} through {:#x} with {} threads, {} byte blocks",
            self.config.start, self.config.end, self.config.threads, self.config.memory_budget
        );

        let segments = self.build_segments()?;
        let blocks = segments.len();
        let records = self.merge_segments(segments)?;

        let elapsed = started.elapsed();
        info!("Sorted {records} records from {blocks} blocks in {elapsed:.2?}");

        Ok(RunSummary { blocks, records, elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = SortConfig::new(5, 4, "/tmp/never-written");
        let err = ExternalSort::new(config).unwrap_err();
        assert!(matches!(err.downcast_ref::<SortError>(), Some(SortError::Configuration(_))));
    }

    #[test]
    fn test_with_codec_keeps_config() {
        let config = SortConfig::new(0, 9, "/tmp/list").with_threads(3);
        let sort = ExternalSort::new(config).unwrap().with_codec(Md5HexCodec);
        assert_eq!(sort.config().threads, 3);
        assert_eq!(sort.config().output, std::path::Path::new("/tmp/list"));
    }

    #[test]
    fn test_run_small_range() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("list");
        let config = SortConfig::new(0, 16, &output).with_threads(2).with_memory_budget(u64::MAX);

        let summary = ExternalSort::new(config).unwrap().run().unwrap();
        assert_eq!(summary.blocks, 1);
        assert_eq!(summary.records, 17);
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 17 * RECORD_SIZE as u64);
        assert!(check_order(&output, Order::Ascending).unwrap().is_sorted());
    }

    #[test]
    fn test_run_truncates_existing_output() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("list");
        std::fs::write(&output, vec![0xffu8; 10 * RECORD_SIZE]).unwrap();

        let config = SortConfig::new(3, 7, &output).with_threads(1).with_memory_budget(64);
        ExternalSort::new(config).unwrap().run().unwrap();
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 5 * RECORD_SIZE as u64);
    }

    #[test]
    fn test_split_phases() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("list");
        let config = SortConfig::new(100, 199, &output).with_threads(3).with_memory_budget(480);
        let sort = ExternalSort::new(config).unwrap();

        let segments = sort.build_segments().unwrap();
        assert_eq!(segments.len(), 4);
        for segment in &segments {
            assert!(check_order(segment.path(), Order::Descending).unwrap().is_sorted());
        }

        assert_eq!(sort.merge_segments(segments).unwrap(), 100);
        assert!(check_order(&output, Order::Ascending).unwrap().is_sorted());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
