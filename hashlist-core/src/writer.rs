//! Sequential, buffered writer for the final ascending output.

use crate::error::SortError;
use crate::merge::MergeStream;
use crate::progress::ProgressTracker;
use crate::record::Record;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Write buffer for the output file
const OUTPUT_BUFFER_SIZE: usize = 1 << 20;

/// Single writer appending raw records to the output file.
///
/// The file is opened for append; callers that want a fresh output truncate
/// it before the run. An exclusive lock is held until the writer finishes.
#[derive(Debug)]
pub struct OutputWriter {
    path: PathBuf,
    out: BufWriter<File>,
    written: u64,
}

impl OutputWriter {
    /// Opens `path` for appending, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is locked by another
    /// writer.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(SortError::io(path))?;

        file.try_lock_exclusive()
            .with_context(|| format!("Output {} is already being written", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::with_capacity(OUTPUT_BUFFER_SIZE, file),
            written: 0,
        })
    }

    /// Appends one record
    ///
    /// # Errors
    ///
    /// Returns `SortError::Io` if the write fails.
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        self.out.write_all(record.as_bytes()).map_err(SortError::io(&self.path))?;
        self.written += 1;
        Ok(())
    }

    /// Writes every record of `stream` until its end, reporting progress.
    ///
    /// Returns the number of records written by this call.
    ///
    /// # Errors
    ///
    /// Returns the first merge or write failure. Dropping the stream after a
    /// write failure stops the merge.
    pub fn drain(&mut self, stream: &mut MergeStream, progress: &ProgressTracker) -> Result<u64> {
        let before = self.written;
        while let Some(record) = stream.next_record()? {
            self.write_record(&record)?;
            progress.log_if_needed(1);
        }
        Ok(self.written - before)
    }

    /// Flushes buffered records, syncs and closes the file.
    ///
    /// Returns the total number of records written.
    ///
    /// # Errors
    ///
    /// Returns `SortError::Io` if the flush or sync fails.
    pub fn finish(self) -> Result<u64> {
        let Self { path, out, written } = self;
        let file = out.into_inner().map_err(|e| SortError::io(&path)(e.into_error()))?;
        file.sync_all().map_err(SortError::io(&path))?;
        Ok(written)
    }
}
