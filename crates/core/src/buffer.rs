//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! C2 — Buffer algebra: overlay a file's pending writes onto its committed
//! blocks without materializing the whole file (§4.2).
//!
//! A file's readable content at any instant is the result of folding, in
//! arrival order, every `Cmd::Write` issued since the file was opened over
//! the committed `blocks`/`dirty_blocks` ranges. `merge_buffers` and its
//! variants compute that fold as a small list of non-overlapping slices
//! instead of an in-memory copy of the whole range, so a read or a sync can
//! answer "what bytes cover `[lo, hi)`" in time proportional to the number
//! of overlapping writes, not file size.

use crate::error::BufferError;
use parsec_sync_types::BlockRef;
use std::cmp::{max, min};

/// Where a buffer slice's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Bytes held directly in memory (an uncommitted `Cmd::Write`).
    Ram(Vec<u8>),
    /// Bytes on a block that has local modifications not yet synced.
    DirtyBlock(BlockRef),
    /// Bytes on a block that is synced and immutable.
    CleanBlock(BlockRef),
}

impl Payload {
    fn kind_rank(&self) -> u8 {
        // Stable tie-break order when two slices cover the same range at
        // the same priority: prefer the more specific source.
        match self {
            Payload::Ram(_) => 0,
            Payload::DirtyBlock(_) => 1,
            Payload::CleanBlock(_) => 2,
        }
    }
}

/// A `[start, end)` span of the file paired with the payload that should be
/// read for it. `priority` orders overlay resolution: higher priority wins
/// on overlap (the most recent write is always highest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSlice {
    pub start: u64,
    pub end: u64,
    pub priority: u64,
    pub payload: Payload,
}

impl BufferSlice {
    pub fn new(start: u64, end: u64, priority: u64, payload: Payload) -> Result<Self, BufferError> {
        if end < start {
            return Err(BufferError::InvalidRange { lo: start, hi: end });
        }
        Ok(Self { start, end, priority, payload })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Restrict this slice to `[lo, hi)`, adjusting an in-memory payload's
    /// bytes accordingly. Returns `None` if the ranges don't overlap.
    pub(crate) fn clip(&self, lo: u64, hi: u64) -> Option<BufferSlice> {
        let start = max(self.start, lo);
        let end = min(self.end, hi);
        if start >= end {
            return None;
        }
        let payload = match &self.payload {
            Payload::Ram(data) => {
                let skip = (start - self.start) as usize;
                let take = (end - start) as usize;
                Payload::Ram(data[skip..skip + take].to_vec())
            }
            other => other.clone(),
        };
        Some(BufferSlice { start, end, priority: self.priority, payload })
    }
}

/// An unordered bag of candidate slices, possibly overlapping, not yet
/// resolved to a single authoritative view. Produced by collecting every
/// write/block touching a range; consumed by `merge_buffers`.
#[derive(Debug, Clone, Default)]
pub struct UncontiguousSpace {
    pub slices: Vec<BufferSlice>,
}

impl UncontiguousSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, slice: BufferSlice) {
        self.slices.push(slice);
    }
}

/// The resolved, non-overlapping, gap-free-or-explicit-gap result of
/// merging an `UncontiguousSpace` over a target range: a list of slices in
/// ascending offset order where each byte of `[lo, hi)` is covered by at
/// most one slice. A byte with no covering slice is simply absent (a
/// sparse hole, e.g. past end-of-file or never written).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContiguousSpace {
    pub slices: Vec<BufferSlice>,
}

/// Drop every candidate slice that cannot possibly contribute a byte to
/// `[lo, hi)`. A cheap prefilter before the full merge (§4.2: "answer
/// without materializing the whole file").
pub fn quick_filter(space: &UncontiguousSpace, lo: u64, hi: u64) -> UncontiguousSpace {
    UncontiguousSpace {
        slices: space
            .slices
            .iter()
            .filter(|s| s.start < hi && s.end > lo)
            .cloned()
            .collect(),
    }
}

/// Resolve overlapping candidate slices into the authoritative,
/// non-overlapping view of `[lo, hi)`. Later writes (higher `priority`)
/// take precedence over earlier ones on overlap; among equal priority,
/// `Payload::kind_rank` breaks ties so the resolution order is stable.
pub fn merge_buffers(space: &UncontiguousSpace, lo: u64, hi: u64) -> Result<ContiguousSpace, BufferError> {
    if hi < lo {
        return Err(BufferError::InvalidRange { lo, hi });
    }
    let filtered = quick_filter(space, lo, hi);
    let mut candidates: Vec<BufferSlice> = filtered
        .slices
        .iter()
        .filter_map(|s| s.clip(lo, hi))
        .collect();
    // Highest priority first; within a priority, Ram > DirtyBlock > CleanBlock.
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.payload.kind_rank().cmp(&b.payload.kind_rank()))
    });

    let mut covered: Vec<(u64, u64)> = Vec::new();
    let mut resolved: Vec<BufferSlice> = Vec::new();
    for candidate in candidates {
        let mut remaining = vec![(candidate.start, candidate.end)];
        for &(cs, ce) in &covered {
            let mut next = Vec::new();
            for (s, e) in remaining {
                if ce <= s || cs >= e {
                    next.push((s, e));
                    continue;
                }
                if cs > s {
                    next.push((s, cs));
                }
                if ce < e {
                    next.push((ce, e));
                }
            }
            remaining = next;
        }
        for (s, e) in remaining {
            if s >= e {
                continue;
            }
            if let Some(clipped) = candidate.clip(s, e) {
                covered.push((s, e));
                resolved.push(clipped);
            }
        }
    }
    resolved.sort_by_key(|s| s.start);
    Ok(ContiguousSpace { slices: resolved })
}

/// Limits on the number and combined size of slices a caller is willing to
/// resolve in one pass (e.g. the syncer bounding how much it uploads per
/// `UPLOAD DATA` step, §4.7). Exceeding `max_slices` or `max_total_size`
/// truncates the merge to a prefix of `[lo, hi)`.
#[derive(Debug, Clone, Copy)]
pub struct MergeLimits {
    pub max_slices: usize,
    pub max_total_size: u64,
}

/// As `merge_buffers`, but stop once either limit would be exceeded,
/// returning the covered prefix of `[lo, hi)` actually resolved.
pub fn merge_buffers_with_limits(
    space: &UncontiguousSpace,
    lo: u64,
    hi: u64,
    limits: MergeLimits,
) -> Result<ContiguousSpace, BufferError> {
    let full = merge_buffers(space, lo, hi)?;
    let mut slices = Vec::new();
    let mut total = 0u64;
    for slice in full.slices {
        if slices.len() >= limits.max_slices || total + slice.len() > limits.max_total_size {
            break;
        }
        total += slice.len();
        slices.push(slice);
    }
    Ok(ContiguousSpace { slices })
}

/// As `merge_buffers_with_limits`, but additionally snap every slice
/// boundary to a multiple of `alignment` bytes (growing slices outward, never
/// shrinking them), so downstream block I/O never splits a write across a
/// partial block boundary. `alignment` must be non-zero.
pub fn merge_buffers_with_limits_and_alignment(
    space: &UncontiguousSpace,
    lo: u64,
    hi: u64,
    limits: MergeLimits,
    alignment: u64,
) -> Result<ContiguousSpace, BufferError> {
    debug_assert!(alignment > 0, "alignment must be non-zero");
    let aligned_lo = lo - (lo % alignment);
    let aligned_hi = match hi % alignment {
        0 => hi,
        rem => hi + (alignment - rem),
    };
    let limited = merge_buffers_with_limits(space, aligned_lo, aligned_hi, limits)?;
    let slices = limited
        .slices
        .into_iter()
        .map(|mut s| {
            s.start -= s.start % alignment;
            let rem = s.end % alignment;
            if rem != 0 {
                s.end += alignment - rem;
            }
            s
        })
        .collect();
    Ok(ContiguousSpace { slices })
}

/// Resolve freshly materialized `(offset, bytes)` buffers against blocks
/// already recorded as dirty, dropping whatever portion `already_dirty`
/// already covers. A file can be flushed more than once before it syncs;
/// without this, re-flushing the same range would mint a second dirty
/// block overlapping the first.
pub fn new_dirty_ranges(
    already_dirty: &[BlockRef],
    buffers: Vec<(u64, Vec<u8>)>,
) -> Result<Vec<(u64, Vec<u8>)>, BufferError> {
    if buffers.is_empty() {
        return Ok(Vec::new());
    }
    let mut space = UncontiguousSpace::new();
    for (i, block) in already_dirty.iter().enumerate() {
        let slice = BufferSlice::new(block.offset, block.end(), 1 + i as u64, Payload::DirtyBlock(block.clone()))?;
        space.push(slice);
    }
    let mut lo = u64::MAX;
    let mut hi = 0u64;
    for (offset, data) in &buffers {
        lo = lo.min(*offset);
        hi = hi.max(offset + data.len() as u64);
    }
    for (offset, data) in buffers {
        let end = offset + data.len() as u64;
        space.push(BufferSlice::new(offset, end, 0, Payload::Ram(data))?);
    }
    let resolved = merge_buffers(&space, lo, hi)?;
    Ok(resolved
        .slices
        .into_iter()
        .filter_map(|s| match s.payload {
            Payload::Ram(data) => Some((s.start, data)),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram(start: u64, data: &[u8], priority: u64) -> BufferSlice {
        BufferSlice::new(start, start + data.len() as u64, priority, Payload::Ram(data.to_vec())).unwrap()
    }

    #[test]
    fn later_write_overlays_earlier_write() {
        let mut space = UncontiguousSpace::new();
        space.push(ram(0, b"AAAAAAAAAA", 0));
        space.push(ram(2, b"BB", 1));
        let merged = merge_buffers(&space, 0, 10).unwrap();
        let mut out = vec![0u8; 10];
        for slice in &merged.slices {
            if let Payload::Ram(data) = &slice.payload {
                out[slice.start as usize..slice.end as usize].copy_from_slice(data);
            }
        }
        assert_eq!(&out, b"AABBAAAAAA");
    }

    #[test]
    fn non_overlapping_slices_both_survive() {
        let mut space = UncontiguousSpace::new();
        space.push(ram(0, b"AA", 0));
        space.push(ram(5, b"BB", 0));
        let merged = merge_buffers(&space, 0, 10).unwrap();
        assert_eq!(merged.slices.len(), 2);
    }

    #[test]
    fn quick_filter_drops_out_of_range_slices() {
        let mut space = UncontiguousSpace::new();
        space.push(ram(0, b"AA", 0));
        space.push(ram(100, b"BB", 0));
        let filtered = quick_filter(&space, 0, 10);
        assert_eq!(filtered.slices.len(), 1);
    }

    #[test]
    fn merge_with_limits_truncates_slice_count() {
        let mut space = UncontiguousSpace::new();
        space.push(ram(0, b"A", 0));
        space.push(ram(2, b"B", 0));
        space.push(ram(4, b"C", 0));
        let limits = MergeLimits { max_slices: 2, max_total_size: 100 };
        let merged = merge_buffers_with_limits(&space, 0, 10, limits).unwrap();
        assert_eq!(merged.slices.len(), 2);
    }

    #[test]
    fn merge_with_alignment_snaps_to_block_boundaries() {
        let mut space = UncontiguousSpace::new();
        space.push(ram(3, b"X", 0));
        let limits = MergeLimits { max_slices: 10, max_total_size: 1000 };
        let merged = merge_buffers_with_limits_and_alignment(&space, 3, 4, limits, 4).unwrap();
        assert_eq!(merged.slices.len(), 1);
        assert_eq!(merged.slices[0].start, 0);
        assert_eq!(merged.slices[0].end, 4);
    }

    #[test]
    fn invalid_range_is_rejected() {
        let space = UncontiguousSpace::new();
        assert!(merge_buffers(&space, 10, 5).is_err());
    }

    #[test]
    fn new_dirty_ranges_drops_already_covered_bytes() {
        let existing = BlockRef {
            access: parsec_sync_types::Access::new_placeholder(),
            offset: 0,
            size: 5,
            digest: [0u8; 32],
        };
        let fresh = new_dirty_ranges(&[existing], vec![(0, b"hello".to_vec())]).unwrap();
        assert!(fresh.is_empty());
    }

    #[test]
    fn new_dirty_ranges_keeps_uncovered_tail() {
        let existing = BlockRef {
            access: parsec_sync_types::Access::new_placeholder(),
            offset: 0,
            size: 3,
            digest: [0u8; 32],
        };
        let fresh = new_dirty_ranges(&[existing], vec![(0, b"hello".to_vec())]).unwrap();
        assert_eq!(fresh, vec![(3, b"lo".to_vec())]);
    }

    #[test]
    fn equal_priority_prefers_ram_over_block_payload() {
        let block = BlockRef {
            access: parsec_sync_types::Access::new_placeholder(),
            offset: 0,
            size: 4,
            digest: [0u8; 32],
        };
        let mut space = UncontiguousSpace::new();
        space.push(BufferSlice::new(0, 4, 0, Payload::CleanBlock(block)).unwrap());
        space.push(ram(0, b"RAM!", 0));
        let merged = merge_buffers(&space, 0, 4).unwrap();
        assert_eq!(merged.slices.len(), 1);
        assert!(matches!(merged.slices[0].payload, Payload::Ram(_)));
    }
}
