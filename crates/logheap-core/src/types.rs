//! Core data types for Logheap.
//!
//! These types describe what ingestion commits and what search reads back:
//!
//! - **Files** are identified by a catalog-assigned [`FileId`]
//! - **Segments** own a contiguous byte range of one file and carry date bounds
//! - **Messages** belong to exactly one segment; their end offset is implied
//!   by the next message of the segment, or the segment end for the last one
//! - **Query records** track a search and the matches streamed into it

use crate::location::Location;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Catalog-assigned identifier of a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl FileId {
    /// Create a new file ID
    pub fn new(id: u64) -> Self {
        FileId(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a committed segment.
///
/// Ids are handed out by the ingestion committer in increasing order, so
/// within a file a larger id always covers later bytes and later dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl SegmentId {
    pub fn new(id: u64) -> Self {
        SegmentId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a query record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub u64);

impl QueryId {
    pub fn new(id: u64) -> Self {
        QueryId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where one message sits in a file, as found by the boundary scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLayout {
    /// Absolute body range
    pub loc: Location,
    /// Date substring, relative to `loc.from`
    pub date_loc: Location,
    /// The body ended at EOF rather than at a following message start
    pub is_tail: bool,
}

impl MessageLayout {
    /// Absolute range of the date substring.
    pub fn date_abs(&self) -> Location {
        self.date_loc.shift(self.loc.from)
    }
}

/// A tracked log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub path: PathBuf,
    /// Size observed at the last discovery
    pub size: u64,
}

/// A committed, size-bounded run of messages in one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub file: FileId,
    pub loc: Location,
    pub date_min: DateTime<Utc>,
    pub date_max: DateTime<Utc>,
}

impl Segment {
    /// True when the segment's date bounds overlap `[min, max]`.
    pub fn overlaps_dates(&self, min: Option<DateTime<Utc>>, max: Option<DateTime<Utc>>) -> bool {
        min.map_or(true, |min| self.date_max >= min) && max.map_or(true, |max| self.date_min <= max)
    }
}

/// Stored form of a message. The end offset is not stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub segment: SegmentId,
    /// Absolute start offset
    pub from: u64,
    /// Date substring relative to `from`
    pub date_loc: Location,
    pub date: DateTime<Utc>,
    pub is_tail: bool,
}

/// A message with its end offset resolved from segment order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub segment: SegmentId,
    pub file: FileId,
    pub loc: Location,
    pub date_loc: Location,
    pub date: DateTime<Utc>,
    pub is_tail: bool,
}

/// A search and its progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: QueryId,
    pub text: String,
    pub date_min: Option<DateTime<Utc>>,
    pub date_max: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub finished: bool,
    /// Number of matches recorded so far
    pub matched: u64,
}

impl QueryRecord {
    /// True when this record was built for the same query and date bounds.
    pub fn same_request(
        &self,
        text: &str,
        date_min: Option<DateTime<Utc>>,
        date_max: Option<DateTime<Utc>>,
    ) -> bool {
        self.text == text && self.date_min == date_min && self.date_max == date_max
    }
}

/// A matched message as recorded for a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundMessage {
    pub file: FileId,
    pub loc: Location,
    pub date: DateTime<Utc>,
}

/// Aggregate counters over the catalog and posting store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub files: usize,
    pub segments: usize,
    pub messages: usize,
    pub tail_messages: usize,
    pub queries: usize,
    pub terms: usize,
    pub indexed_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_layout_date_abs() {
        let layout = MessageLayout {
            loc: Location::new(100, 150),
            date_loc: Location::new(1, 20),
            is_tail: false,
        };
        assert_eq!(layout.date_abs(), Location::new(101, 120));
    }

    #[test]
    fn test_segment_date_overlap() {
        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();
        let seg = Segment {
            id: SegmentId::new(1),
            file: FileId::new(1),
            loc: Location::new(0, 10),
            date_min: day(5),
            date_max: day(10),
        };
        assert!(seg.overlaps_dates(None, None));
        assert!(seg.overlaps_dates(Some(day(10)), None));
        assert!(seg.overlaps_dates(None, Some(day(5))));
        assert!(!seg.overlaps_dates(Some(day(11)), None));
        assert!(!seg.overlaps_dates(Some(day(1)), Some(day(4))));
    }
}
