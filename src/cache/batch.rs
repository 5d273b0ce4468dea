//! Batch chunking
//!
//! Splits a large key list into request-sized sub-batches. Lists at or below
//! `threshold` go out as one batch. Above it, batches of `batch_size` are cut
//! from the front, and a trailing remainder smaller than half a batch is
//! folded into the preceding batch instead of being sent on its own.

use std::ops::Range;

/// Compute the index ranges a list of `len` items is sent in.
///
/// The ranges are contiguous, ordered, non-empty and cover `0..len` exactly.
pub fn chunk_ranges(len: usize, batch_size: usize, threshold: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    if len <= threshold || threshold <= batch_size || batch_size < 2 {
        return vec![0..len];
    }

    let half = batch_size / 2;
    let mut ranges = Vec::with_capacity(len / batch_size + 1);
    let mut from = 0;
    let mut to = batch_size;
    while to < len {
        ranges.push(from..to);
        from = to;
        to += batch_size;
        if len.saturating_sub(to) < half {
            to = len;
            ranges.push(from..to);
        }
    }
    ranges
}

// =============================================================================
// Tests
// =============================================================================
