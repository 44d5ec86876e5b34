//! Splitting a file into byte ranges downloaded in parallel.

use ridge_core::config::MAX_PARTS;

/// One byte range `[offset, offset + length)` of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

/// Tile `[0, size)` with at most `max_parts` ranges (capped at `MAX_PARTS`).
/// Every part gets `size / n` bytes and the last absorbs the remainder.
/// A part is never empty, so a file smaller than the part count gets one
/// part per byte, and an empty file gets no parts at all.
pub fn plan_parts(size: u64, max_parts: usize) -> Vec<PartPlan> {
    let wanted = max_parts.clamp(1, MAX_PARTS) as u64;
    let num_parts = wanted.min(size);
    if num_parts == 0 {
        return Vec::new();
    }

    let part_size = size / num_parts;
    (0..num_parts)
        .map(|i| {
            let offset = i * part_size;
            let length = if i == num_parts - 1 {
                size - offset
            } else {
                part_size
            };
            PartPlan {
                index: i as usize,
                offset,
                length,
            }
        })
        .collect()
}
