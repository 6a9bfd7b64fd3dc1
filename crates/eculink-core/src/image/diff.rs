//! Differential comparison of configuration images
//!
//! Uploading a changed configuration only transfers the bytes that differ.
//! The comparison walks both images with a cursor and yields one contiguous
//! run of differing bytes at a time.

use std::ops::Range;

/// Find the next contiguous run of differing bytes at or after `from`.
///
/// Returns a half-open byte range, or `None` when the images agree from
/// `from` through the end. Both slices must have the same length.
pub fn next_difference(a: &[u8], b: &[u8], from: usize) -> Option<Range<usize>> {
    debug_assert_eq!(a.len(), b.len());
    let len = a.len().min(b.len());

    let mut start = from;
    while start < len && a[start] == b[start] {
        start += 1;
    }
    if start >= len {
        return None;
    }

    let mut end = start + 1;
    while end < len && a[end] != b[end] {
        end += 1;
    }
    Some(start..end)
}
