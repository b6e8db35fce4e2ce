//! Half-open byte ranges and the range algebra used by ingestion.
//!
//! A [`Location`] addresses `[from, to)` inside one file. Ingestion derives
//! the unindexed parts of a file by subtracting committed segment ranges from
//! `[0, size)`, merging what is left into contiguous runs and splitting those
//! runs into bounded chunks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A half-open byte range `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Location {
    pub from: u64,
    pub to: u64,
}

impl Location {
    /// Create a location. `to` is clamped so the range is never negative.
    pub fn new(from: u64, to: u64) -> Self {
        Location {
            from,
            to: to.max(from),
        }
    }

    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.from && pos < self.to
    }

    /// True when the ranges overlap or touch.
    pub fn intersects(&self, other: &Location) -> bool {
        self.from <= other.to && self.to >= other.from
    }

    /// The overlapping part, if any bytes are shared.
    pub fn intersection(&self, other: &Location) -> Option<Location> {
        let from = self.from.max(other.from);
        let to = self.to.min(other.to);
        (from < to).then_some(Location { from, to })
    }

    /// What is left of `self` after removing `other`: zero, one or two pieces.
    pub fn difference(&self, other: &Location) -> Vec<Location> {
        let Some(cut) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        };

        let mut pieces = Vec::with_capacity(2);
        if cut.from > self.from {
            pieces.push(Location::new(self.from, cut.from));
        }
        if cut.to < self.to {
            pieces.push(Location::new(cut.to, self.to));
        }
        pieces
    }

    /// Split into consecutive chunks of at most `max_len` bytes.
    pub fn split(&self, max_len: u64) -> Vec<Location> {
        if max_len == 0 || self.len() <= max_len {
            return vec![*self];
        }

        let mut chunks = Vec::with_capacity((self.len() / max_len + 1) as usize);
        let mut from = self.from;
        while from < self.to {
            let to = (from + max_len).min(self.to);
            chunks.push(Location { from, to });
            from = to;
        }
        chunks
    }

    /// Express this location relative to `base` (which must not lie after it).
    pub fn relative_to(&self, base: u64) -> Location {
        Location::new(self.from.saturating_sub(base), self.to.saturating_sub(base))
    }

    /// Move this location forward by `offset` bytes.
    pub fn shift(&self, offset: u64) -> Location {
        Location::new(self.from + offset, self.to + offset)
    }

    pub fn as_range(&self) -> std::ops::Range<usize> {
        self.from as usize..self.to as usize
    }

    /// `bytes` with this range cut out (clamped to the slice).
    ///
    /// Ingestion and search both cut the date out of a message body this
    /// way, so they tokenize and match identical bytes.
    pub fn excise(&self, bytes: &[u8]) -> Vec<u8> {
        let from = (self.from as usize).min(bytes.len());
        let to = (self.to as usize).clamp(from, bytes.len());
        let mut out = Vec::with_capacity(bytes.len() - (to - from));
        out.extend_from_slice(&bytes[..from]);
        out.extend_from_slice(&bytes[to..]);
        out
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.from, self.to)
    }
}

/// Sort and merge overlapping or touching locations into contiguous runs.
pub fn merge_locations(mut locations: Vec<Location>) -> Vec<Location> {
    locations.sort_unstable();

    let mut merged: Vec<Location> = Vec::with_capacity(locations.len());
    for loc in locations {
        match merged.last_mut() {
            Some(cur) if cur.intersects(&loc) => {
                cur.from = cur.from.min(loc.from);
                cur.to = cur.to.max(loc.to);
            }
            _ => merged.push(loc),
        }
    }
    merged
}

/// Remove every location in `excluded` from `src`, returning merged leftovers.
pub fn exclude_locations(src: Location, excluded: &[Location]) -> Vec<Location> {
    let mut remaining = if src.is_empty() { Vec::new() } else { vec![src] };
    for cut in excluded {
        remaining = remaining
            .iter()
            .flat_map(|piece| piece.difference(cut))
            .collect();
    }
    merge_locations(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(from: u64, to: u64) -> Location {
        Location::new(from, to)
    }

    #[test]
    fn test_contains_is_half_open() {
        let l = loc(10, 20);
        assert!(l.contains(10));
        assert!(l.contains(19));
        assert!(!l.contains(20));
        assert!(!loc(5, 5).contains(5));
    }

    #[test]
    fn test_difference() {
        assert_eq!(loc(0, 100).difference(&loc(20, 30)), vec![loc(0, 20), loc(30, 100)]);
        assert_eq!(loc(0, 100).difference(&loc(0, 30)), vec![loc(30, 100)]);
        assert_eq!(loc(0, 100).difference(&loc(50, 200)), vec![loc(0, 50)]);
        assert!(loc(10, 20).difference(&loc(0, 100)).is_empty());
        // Touching but not overlapping leaves the source intact
        assert_eq!(loc(0, 10).difference(&loc(10, 20)), vec![loc(0, 10)]);
    }

    #[test]
    fn test_split() {
        assert_eq!(loc(0, 10).split(20), vec![loc(0, 10)]);
        assert_eq!(
            loc(5, 30).split(10),
            vec![loc(5, 15), loc(15, 25), loc(25, 30)]
        );
    }

    #[test]
    fn test_merge_locations() {
        let merged = merge_locations(vec![loc(20, 30), loc(0, 10), loc(10, 15), loc(40, 50), loc(45, 60)]);
        assert_eq!(merged, vec![loc(0, 15), loc(20, 30), loc(40, 60)]);
    }

    #[test]
    fn test_exclude_locations() {
        let left = exclude_locations(loc(0, 100), &[loc(0, 20), loc(50, 60), loc(90, 120)]);
        assert_eq!(left, vec![loc(20, 50), loc(60, 90)]);

        assert!(exclude_locations(loc(0, 45), &[loc(0, 45)]).is_empty());
        assert!(exclude_locations(loc(0, 0), &[]).is_empty());
    }

    #[test]
    fn test_excise() {
        assert_eq!(loc(1, 11).excise(b"[2024-01-01] boot"), b"[] boot".to_vec());
        assert_eq!(loc(5, 50).excise(b"abcdefg"), b"abcde".to_vec());
        assert_eq!(loc(0, 0).excise(b"abc"), b"abc".to_vec());
    }

    #[test]
    fn test_relative_and_shift() {
        assert_eq!(loc(105, 125).relative_to(100), loc(5, 25));
        assert_eq!(loc(5, 25).shift(100), loc(105, 125));
    }
}
