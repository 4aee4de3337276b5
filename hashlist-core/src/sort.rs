//! In-place parallel quicksort of record buffers into descending key order.
//!
//! # Algorithm
//!
//! - Pivot is the last record of the range.
//! - Partition scans low to high and moves every record whose key is `>=` the
//!   pivot into a growing prefix, then swaps the pivot to the prefix end.
//! - The two sides are sorted concurrently with `rayon::join` while the fork
//!   budget lasts, sequentially afterwards.
//! - Ranges of at most [`INSERTION_SORT_THRESHOLD`] records use insertion sort.
//!
//! Sides are disjoint `&mut` slices from `split_at_mut`, so concurrent halves
//! never touch the same bytes. Duplicate keys are allowed but their relative
//! order is unspecified.

use crate::record::Record;
use rayon::ThreadPool;

/// Ranges at or below this length are insertion sorted
pub const INSERTION_SORT_THRESHOLD: usize = 8;

/// Sorts `records` in place, largest key first, using the threads of `pool`.
///
/// The fork budget equals the pool size; once it is spent the recursion
/// continues sequentially on the worker that owns the range.
pub fn sort_descending(records: &mut [Record], pool: &ThreadPool) {
    let forks = pool.current_num_threads();
    pool.install(|| sort_range(records, forks));
}

/// Sorts `records` in place on the calling thread
pub fn sort_descending_sequential(records: &mut [Record]) {
    sort_range(records, 1);
}

/// Insertion sort, largest key first
pub fn insertion_sort_descending(records: &mut [Record]) {
    for i in 1..records.len() {
        let mut j = i;
        while j > 0 && records[j].key() > records[j - 1].key() {
            records.swap(j, j - 1);
            j -= 1;
        }
    }
}

/// Returns true if no adjacent pair is in ascending key order
pub fn is_sorted_descending(records: &[Record]) -> bool {
    records.windows(2).all(|pair| pair[0].key() >= pair[1].key())
}

fn sort_range(records: &mut [Record], forks: usize) {
    let mut records = records;
    loop {
        if records.len() <= INSERTION_SORT_THRESHOLD {
            insertion_sort_descending(records);
            return;
        }

        let pivot = partition(records);
        let (greater, rest) = std::mem::take(&mut records).split_at_mut(pivot);
        let lesser = &mut rest[1..];

        if forks > 1 {
            let left = forks / 2;
            let right = forks - left;
            rayon::join(|| sort_range(greater, left), || sort_range(lesser, right));
            return;
        }

        // Recurse into the smaller side so stack depth stays logarithmic
        if greater.len() < lesser.len() {
            sort_range(greater, 1);
            records = lesser;
        } else {
            sort_range(lesser, 1);
            records = greater;
        }
    }
}

/// Partitions around the last record; returns the pivot's final index.
///
/// Afterwards `records[..p]` have keys `>=` the pivot and `records[p + 1..]`
/// have smaller keys.
fn partition(records: &mut [Record]) -> usize {
    let last = records.len() - 1;
    let pivot = records[last].key();
    let mut boundary = 0;

    for current in 0..last {
        if records[current].key() >= pivot {
            records.swap(current, boundary);
            boundary += 1;
        }
    }

    records.swap(last, boundary);
    boundary
}
