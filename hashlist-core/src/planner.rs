//! Splits the ID range into memory-sized blocks and builds them one by one.
//!
//! Blocks are built strictly sequentially (parallel only inside a block), so
//! at most one block buffer is alive at any time.

use crate::block::BlockBuilder;
use crate::config::SortConfig;
use crate::record::RecordCodec;
use crate::segment::Segment;
use anyhow::Result;
use log::info;

/// Builds every block of `config` and returns the persisted segments in
/// block order.
///
/// Block `i` covers `[cursor, min(cursor + records_per_block - 1, end)]`.
/// Each block is generated, sorted and persisted before the next one starts.
///
/// # Errors
///
/// Returns a configuration error before any work if `config` is invalid, or
/// the first generation/persist failure. Segments written before a failure
/// are left on disk for the caller to clean up.
pub fn plan_blocks<C: RecordCodec>(config: &SortConfig, codec: &C) -> Result<Vec<Segment>> {
    config.validate()?;

    let per_block = config.records_per_block()?;
    let builder = BlockBuilder::new(config.threads)?;
    let prefix = config.segment_prefix();

    let mut segments = Vec::new();
    let mut cursor = config.start;

    loop {
        let block_id = segments.len();
        let block_end = cursor.saturating_add(per_block - 1).min(config.end);

        info!("--- Block {block_id}: {cursor:#010x} through {block_end:#010x} ---");

        let mut block = builder.generate(block_id, cursor, block_end, codec)?;
        info!("Done generating {} records.", block.len());

        builder.sort(&mut block);
        info!("Done sorting records.");

        let segment = block.persist(&Segment::path_for(prefix, block_id))?;
        info!("Done writing block to {}.", segment.path().display());

        segments.push(segment);

        if block_end == config.end {
            break;
        }
        cursor = block_end + 1;
    }

    Ok(segments)
}

/// Number of blocks `config` will produce
///
/// # Errors
///
/// Returns a configuration error if `config` is invalid.
pub fn block_count(config: &SortConfig) -> Result<u64> {
    config.validate()?;
    Ok(config.record_count()?.div_ceil(config.records_per_block()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SortError;
    use crate::record::{Md5HexCodec, RECORD_SIZE};
    use tempfile::TempDir;

    #[test]
    fn test_single_block_when_budget_is_large() {
        let dir = TempDir::new().unwrap();
        let config = SortConfig::new(0, 16, dir.path().join("list")).with_threads(2);

        let segments = plan_blocks(&config, &Md5HexCodec).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].records(), 17);
        assert_eq!(segments[0].path(), dir.path().join("list0"));
        assert_eq!(block_count(&config).unwrap(), 1);
    }

    #[test]
    fn test_blocks_cover_range_in_order() {
        let dir = TempDir::new().unwrap();
        let config = SortConfig::new(10, 109, dir.path().join("list"))
            .with_threads(3)
            .with_memory_budget(30 * RECORD_SIZE as u64);

        let segments = plan_blocks(&config, &Md5HexCodec).unwrap();
        let sizes: Vec<u64> = segments.iter().map(Segment::records).collect();
        assert_eq!(sizes, vec![30, 30, 30, 10]);
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.id(), i);
            assert_eq!(
                std::fs::metadata(segment.path()).unwrap().len(),
                segment.records() * RECORD_SIZE as u64
            );
        }
        assert_eq!(block_count(&config).unwrap(), 4);
    }

    #[test]
    fn test_one_record_blocks() {
        let dir = TempDir::new().unwrap();
        let config = SortConfig::new(16, 18, dir.path().join("list"))
            .with_threads(2)
            .with_memory_budget(RECORD_SIZE as u64);

        let segments = plan_blocks(&config, &Md5HexCodec).unwrap();
        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| s.records() == 1));
    }

    #[test]
    fn test_range_ending_at_u64_max() {
        let dir = TempDir::new().unwrap();
        let config = SortConfig::new(u64::MAX - 4, u64::MAX, dir.path().join("list"))
            .with_threads(1)
            .with_memory_budget(2 * RECORD_SIZE as u64);

        let segments = plan_blocks(&config, &Md5HexCodec).unwrap();
        let sizes: Vec<u64> = segments.iter().map(Segment::records).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_invalid_config_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let config = SortConfig::new(0, 16, dir.path().join("list")).with_memory_budget(8);

        let err = plan_blocks(&config, &Md5HexCodec).unwrap_err();
        assert!(matches!(err.downcast_ref::<SortError>(), Some(SortError::Configuration(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
