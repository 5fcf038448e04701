// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Interval map partitioning an address space among competing owners
//!
//! An [`AddressRange`] stores half-open `[start, end)` spans tagged with an
//! owner value. Adjacent or overlapping spans with an equal owner are merged
//! into one; a strict overlap between different owners is rejected at insert
//! time. Lookups resolve a queried span into the ordered list of owner
//! segments that exactly cover it.
//!
//! The register dispatcher keeps one of these maps per store kind, with
//! addresses encoded as `(slave_id << 16) | local_address` so that every
//! slave gets its own 65536-cell window.

use std::collections::BTreeMap;
use std::fmt::Debug;

use thiserror::Error;

/// Returned when an inserted span strictly overlaps a span with a different owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("range [{start}, {}) overlaps an already registered range", start + count)]
pub struct OverlapError {
    pub start: i64,
    pub count: i64,
}

/// Returned by lookups that cannot be resolved against the registered spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RangeError {
    /// No single segment covers the queried span.
    #[error("range [{start}, {}) is not covered by a registered range", start + count)]
    NotCovered { start: i64, count: i64 },
    /// The walk hit a hole between two registered segments.
    #[error("sparse area at address {0}")]
    Sparse(i64),
    /// The walk ran past the end of the registered area.
    #[error("range runs out of bounds at address {start} ({count} cells left)")]
    OutOfBounds { start: i64, count: i64 },
}

/// One contiguous span owned by a single value, as resolved by
/// [`AddressRange::get_segments`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<T> {
    pub start: i64,
    pub count: i64,
    pub param: T,
}

/// Ordered interval map over half-open `[start, end)` spans.
///
/// Invariants maintained by [`insert`](Self::insert):
/// * segments never overlap;
/// * two adjacent segments always have different owners (equal owners are
///   coalesced into one segment).
#[derive(Debug, Clone)]
pub struct AddressRange<T> {
    // start -> (end, owner)
    segments: BTreeMap<i64, (i64, T)>,
}

impl<T> Default for AddressRange<T> {
    fn default() -> Self {
        Self {
            segments: BTreeMap::new(),
        }
    }
}

impl<T: Clone + PartialEq> AddressRange<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `[start, start + count)` for `param`.
    ///
    /// Spans that touch or overlap an existing span with an equal owner are
    /// merged. A strict overlap with a different owner fails; exact
    /// adjacency between different owners is legal. `count <= 0` is a no-op.
    pub fn insert(&mut self, start: i64, count: i64, param: T) -> Result<(), OverlapError> {
        if count <= 0 {
            return Ok(());
        }
        let mut start = start;
        let mut end = start + count;

        // Probe the segment at or before `start`.
        if let Some((&prev_start, prev)) = self.segments.range(..=start).next_back() {
            let (prev_end, prev_param) = (prev.0, &prev.1);
            if prev_end >= start {
                if *prev_param == param {
                    start = prev_start;
                } else if prev_end > start {
                    return Err(OverlapError { start, count });
                }
            }
        }

        // Absorb every segment starting inside the (possibly widened) span.
        loop {
            let (seg_start, seg_end, seg_param) = match self.segments.range(start..).next() {
                Some((&s, seg)) if s < end => (s, seg.0, seg.1.clone()),
                _ => break,
            };
            if seg_param != param {
                return Err(OverlapError { start, count });
            }
            if seg_end > end {
                end = seg_end;
            }
            self.segments.remove(&seg_start);
        }

        // Absorb an equal-owner neighbour starting exactly at `end`.
        let right = match self.segments.range(end..).next() {
            Some((&s, seg)) if s == end && seg.1 == param => Some((s, seg.0)),
            _ => None,
        };
        if let Some((right_start, right_end)) = right {
            self.segments.remove(&right_start);
            end = right_end;
        }

        self.segments.insert(start, (end, param));
        Ok(())
    }

    /// Merges every segment of `other` into `self`, keeping the owners.
    pub fn insert_range(&mut self, other: &AddressRange<T>) -> Result<(), OverlapError> {
        for (&start, seg) in &other.segments {
            self.insert(start, seg.0 - start, seg.1.clone())?;
        }
        Ok(())
    }

    /// Merges the segment layout of `other` into `self` under a single owner.
    pub fn insert_range_as<U>(
        &mut self,
        other: &AddressRange<U>,
        param: T,
    ) -> Result<(), OverlapError> {
        for (&start, seg) in &other.segments {
            self.insert(start, seg.0 - start, param.clone())?;
        }
        Ok(())
    }

    /// Translates every segment by `offset` (which may be negative).
    pub fn shift(&mut self, offset: i64) {
        let old = std::mem::take(&mut self.segments);
        self.segments = old
            .into_iter()
            .map(|(start, (end, param))| (start + offset, (end + offset, param)))
            .collect();
    }

    /// Returns the owner of `[start, start + count)` if one segment covers it all.
    pub fn get_param(&self, start: i64, count: i64) -> Result<T, RangeError> {
        match self.segments.range(..=start).next_back() {
            Some((_, seg)) if count > 0 && seg.0 >= start + count => Ok(seg.1.clone()),
            _ => Err(RangeError::NotCovered { start, count }),
        }
    }

    /// Resolves `[start, start + count)` into the ordered owner segments that
    /// exactly cover it, clipped to the queried bounds.
    pub fn get_segments(&self, start: i64, count: i64) -> Result<Vec<Segment<T>>, RangeError> {
        if count <= 0 {
            return Ok(Vec::new());
        }
        let mut start = start;
        let mut count = count;
        let mut out = Vec::new();

        let (mut seg_end, mut param) = match self.segments.range(..=start).next_back() {
            Some((_, seg)) if seg.0 > start => (seg.0, seg.1.clone()),
            _ => return Err(RangeError::NotCovered { start, count }),
        };

        loop {
            let take = (seg_end - start).min(count);
            out.push(Segment {
                start,
                count: take,
                param: param.clone(),
            });
            start += take;
            count -= take;
            if count == 0 {
                return Ok(out);
            }
            match self.segments.range(start..).next() {
                Some((&s, seg)) if s == start => {
                    seg_end = seg.0;
                    param = seg.1.clone();
                }
                Some(_) => return Err(RangeError::Sparse(start)),
                None => return Err(RangeError::OutOfBounds { start, count }),
            }
        }
    }

    /// True when `[start, start + count)` is fully covered by registered segments.
    pub fn in_range(&self, start: i64, count: i64) -> bool {
        self.get_segments(start, count).is_ok()
    }

    /// Lowest registered address, 0 when empty.
    pub fn start(&self) -> i64 {
        self.segments.keys().next().copied().unwrap_or(0)
    }

    /// One past the highest registered address, 0 when empty.
    pub fn end(&self) -> i64 {
        self.segments.values().next_back().map(|s| s.0).unwrap_or(0)
    }

    /// Total number of registered cells across all segments.
    pub fn count(&self) -> i64 {
        self.segments.iter().map(|(&s, seg)| seg.0 - s).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Iterates segments in address order as `(start, end, owner)`.
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, &T)> {
        self.segments.iter().map(|(&s, seg)| (s, seg.0, &seg.1))
    }
}

impl<T: Clone + PartialEq> PartialEq for AddressRange<T> {
    fn eq(&self, other: &Self) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|(a, b)| a.0 == b.0 && a.1 == b.1 && a.2 == b.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(range: &AddressRange<i32>) -> Vec<(i64, i64, i32)> {
        range.iter().map(|(s, e, p)| (s, e, *p)).collect()
    }

    #[test]
    fn adjacent_spans_with_equal_owner_merge() {
        let mut range = AddressRange::new();
        range.insert(0, 10, 1).unwrap();
        range.insert(10, 10, 1).unwrap();
        assert_eq!(layout(&range), vec![(0, 20, 1)]);
        assert_eq!(range.count(), 20);
    }

    #[test]
    fn equal_owner_right_neighbour_is_absorbed() {
        let mut range = AddressRange::new();
        range.insert(10, 10, 1).unwrap();
        range.insert(0, 10, 1).unwrap();
        assert_eq!(layout(&range), vec![(0, 20, 1)]);

        // A different owner on the right stays its own segment.
        let mut range = AddressRange::new();
        range.insert(10, 10, 2).unwrap();
        range.insert(0, 10, 1).unwrap();
        assert_eq!(layout(&range), vec![(0, 10, 1), (10, 20, 2)]);
    }

    #[test]
    fn overlapping_spans_with_equal_owner_merge() {
        let mut range = AddressRange::new();
        range.insert(0, 10, 1).unwrap();
        range.insert(5, 10, 1).unwrap();
        range.insert(20, 5, 1).unwrap();
        range.insert(14, 7, 1).unwrap();
        assert_eq!(layout(&range), vec![(0, 25, 1)]);
    }

    #[test]
    fn adjacent_spans_with_different_owners_are_legal() {
        let mut range = AddressRange::new();
        range.insert(0, 10, 1).unwrap();
        range.insert(10, 5, 2).unwrap();
        assert_eq!(range.get_param(9, 1), Ok(1));
        assert_eq!(range.get_param(10, 5), Ok(2));
        assert_eq!(layout(&range), vec![(0, 10, 1), (10, 15, 2)]);
    }

    #[test]
    fn strict_overlap_with_different_owner_fails() {
        let mut range = AddressRange::new();
        range.insert(0, 10, 1).unwrap();
        assert_eq!(
            range.insert(5, 10, 2),
            Err(OverlapError { start: 5, count: 10 })
        );
        // Inserting over a smaller foreign span fails too.
        let mut range = AddressRange::new();
        range.insert(10, 5, 2).unwrap();
        assert!(range.insert(0, 20, 1).is_err());
    }

    #[test]
    fn inner_spans_are_absorbed() {
        let mut range = AddressRange::new();
        range.insert(0, 5, 1).unwrap();
        range.insert(10, 5, 1).unwrap();
        range.insert(0, 20, 1).unwrap();
        assert_eq!(layout(&range), vec![(0, 20, 1)]);
    }

    #[test]
    fn get_param_requires_single_covering_segment() {
        let mut range = AddressRange::new();
        range.insert(0, 10, 1).unwrap();
        range.insert(10, 10, 2).unwrap();
        assert_eq!(range.get_param(0, 10), Ok(1));
        assert!(range.get_param(5, 10).is_err());
        assert!(range.get_param(25, 1).is_err());
    }

    #[test]
    fn get_segments_partitions_a_span_in_order() {
        let mut range = AddressRange::new();
        range.insert(0, 10, 1).unwrap();
        range.insert(10, 10, 2).unwrap();
        let segments = range.get_segments(5, 10).unwrap();
        assert_eq!(
            segments,
            vec![
                Segment {
                    start: 5,
                    count: 5,
                    param: 1
                },
                Segment {
                    start: 10,
                    count: 5,
                    param: 2
                },
            ]
        );
    }

    #[test]
    fn get_segments_reports_holes_and_overruns() {
        let mut range = AddressRange::new();
        range.insert(0, 5, 1).unwrap();
        range.insert(10, 5, 2).unwrap();
        assert_eq!(range.get_segments(0, 12), Err(RangeError::Sparse(5)));
        assert_eq!(
            range.get_segments(10, 10),
            Err(RangeError::OutOfBounds {
                start: 15,
                count: 5
            })
        );
        assert_eq!(
            range.get_segments(20, 2),
            Err(RangeError::NotCovered {
                start: 20,
                count: 2
            })
        );
    }

    #[test]
    fn shift_translates_all_segments() {
        let mut range = AddressRange::new();
        range.insert(0, 10, 1).unwrap();
        range.shift(1 << 16);
        assert!(!range.in_range(0, 10));
        assert_eq!(range.get_param(1 << 16, 10), Ok(1));
        range.shift(-(1 << 16));
        assert_eq!(range.get_param(0, 10), Ok(1));
    }

    #[test]
    fn insert_range_unions_two_maps() {
        let mut a = AddressRange::new();
        a.insert(0, 10, 1).unwrap();
        let mut b = AddressRange::new();
        b.insert(10, 10, 1).unwrap();
        b.insert(30, 5, 2).unwrap();
        a.insert_range(&b).unwrap();
        assert_eq!(layout(&a), vec![(0, 20, 1), (30, 35, 2)]);

        let mut c = AddressRange::new();
        c.insert(5, 10, 9).unwrap();
        assert!(a.insert_range(&c).is_err());
    }

    #[test]
    fn insert_range_as_overrides_the_owner() {
        let mut shape = AddressRange::new();
        shape.insert(0, 4, "x").unwrap();
        shape.insert(8, 4, "y").unwrap();
        let mut range: AddressRange<i32> = AddressRange::new();
        range.insert_range_as(&shape, 7).unwrap();
        assert_eq!(layout(&range), vec![(0, 4, 7), (8, 12, 7)]);
    }

    #[test]
    fn segment_wise_equality() {
        let mut a = AddressRange::new();
        a.insert(0, 10, 1).unwrap();
        a.insert(10, 10, 1).unwrap();
        let mut b = AddressRange::new();
        b.insert(0, 20, 1).unwrap();
        assert_eq!(a, b);
        b.insert(30, 2, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_range_accessors() {
        let range: AddressRange<i32> = AddressRange::new();
        assert!(range.is_empty());
        assert_eq!(range.start(), 0);
        assert_eq!(range.end(), 0);
        assert_eq!(range.count(), 0);
        assert!(!range.in_range(0, 1));
    }
}
