//! Near-equal contiguous splitting of an index space.
//!
//! Used both to hand ID sub-ranges to generation workers and to hand segment
//! subsets to merge lanes. Ranges are derived arithmetically, never from a
//! shared cursor, so disjointness holds by construction.

use std::ops::Range;

/// Splits `0..len` into `parts` contiguous ranges.
///
/// Every range has `len / parts` elements except the last, which absorbs the
/// remainder. When `parts > len` the leading ranges are empty. Returns no
/// ranges when `parts == 0`.
pub fn split_even(len: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }

    let stride = len / parts;
    (0..parts)
        .map(|i| {
            let start = i * stride;
            let end = if i == parts - 1 { len } else { start + stride };
            start..end
        })
        .collect()
}
