//! Message boundary detection.
//!
//! A message starts where the start pattern matches and ends where the next
//! message starts, so the scanner always looks one message ahead before it
//! emits the previous one. The last message of a read ends at the end of the
//! readable data and is flagged as a tail: the writer may still be appending
//! to it.
//!
//! Reading is a single linear pass through a small rolling buffer. Bytes
//! before the current search point are dropped, except for a bounded overlap
//! so a start pattern split across two reads is still recognised, and one
//! byte of context so anchors like `^` see the real preceding byte.

use crate::error::{LogheapError, Result};
use crate::location::Location;
use crate::types::MessageLayout;
use regex::bytes::Regex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::trace;

/// Default number of bytes requested per read.
pub const DEFAULT_READ_SIZE: usize = 64 * 1024;

/// Longest start-pattern match the scanner can recognise across reads.
const MAX_START_LEN: usize = 4096;

/// Finds message starts with a regex whose first capture group is the date.
#[derive(Debug, Clone)]
pub struct BoundaryScanner {
    start: Regex,
    read_size: usize,
}

impl BoundaryScanner {
    /// Compile a start pattern.
    ///
    /// The pattern must not match the empty string. Without a capture group
    /// the whole match is taken as the date.
    pub fn new(pattern: &str) -> Result<Self> {
        let start = Regex::new(pattern).map_err(|e| LogheapError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        if start.is_match(b"") {
            return Err(LogheapError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "message start pattern matches the empty string".to_string(),
            });
        }
        Ok(BoundaryScanner {
            start,
            read_size: DEFAULT_READ_SIZE,
        })
    }

    /// Set the read size (at least one byte).
    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(1);
        self
    }

    pub fn pattern(&self) -> &str {
        self.start.as_str()
    }

    /// Stream the messages whose start lies in one of `locations`.
    ///
    /// `file_size` bounds the read even if the file keeps growing. A message
    /// may extend past the locations up to the next start. When no kept start
    /// exists the stream yields a single `NoMessageStartFound`.
    pub fn scan<R: Read + Seek>(
        &self,
        mut reader: R,
        file_size: u64,
        locations: &[Location],
    ) -> Result<Layouts<'_, R>> {
        let from = locations.iter().map(|l| l.from).min().unwrap_or(0);
        let stop = locations.iter().map(|l| l.to).max().unwrap_or(0);

        // One byte before the window gives the regex its left context.
        let origin = from.saturating_sub(1).min(file_size);
        reader.seek(SeekFrom::Start(origin))?;

        Ok(Layouts {
            scanner: self,
            reader: reader.take(file_size.saturating_sub(origin)),
            locations: locations.to_vec(),
            stop,
            buf: Vec::with_capacity(self.read_size + MAX_START_LEN),
            buf_start: origin,
            search_from: from.max(origin),
            eof: false,
            pending: None,
            emitted: false,
            done: locations.is_empty(),
            reported_empty: locations.is_empty(),
        })
    }

    /// Scan a file on disk and collect the layouts.
    pub fn scan_file(
        &self,
        path: &Path,
        file_size: u64,
        locations: &[Location],
    ) -> Result<Vec<MessageLayout>> {
        let file = File::open(path)?;
        self.scan(file, file_size, locations)?.collect()
    }
}

/// Streaming iterator over message layouts, see [`BoundaryScanner::scan`].
pub struct Layouts<'s, R> {
    scanner: &'s BoundaryScanner,
    reader: io::Take<R>,
    locations: Vec<Location>,
    stop: u64,
    buf: Vec<u8>,
    /// Absolute offset of `buf[0]`
    buf_start: u64,
    /// Absolute offset where the next start search begins
    search_from: u64,
    eof: bool,
    /// Start offset and relative date range of the message awaiting its end
    pending: Option<(u64, Location)>,
    emitted: bool,
    done: bool,
    reported_empty: bool,
}

impl<R: Read> Layouts<'_, R> {
    fn fill(&mut self) -> Result<()> {
        let len = self.buf.len();
        self.buf.resize(len + self.scanner.read_size, 0);
        let n = loop {
            match self.reader.read(&mut self.buf[len..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(len);
                    return Err(e.into());
                }
            }
        };
        self.buf.truncate(len + n);
        if n == 0 {
            self.eof = true;
        }
        Ok(())
    }

    /// Drop buffered bytes before `keep_from` (a buffer index).
    fn compact(&mut self, keep_from: usize) {
        if keep_from > 0 {
            self.buf.drain(..keep_from);
            self.buf_start += keep_from as u64;
        }
    }

    /// Locate the next message start at or after `search_from`.
    fn next_start(&mut self) -> Result<Option<(u64, Location)>> {
        loop {
            let rel = (self.search_from - self.buf_start) as usize;
            if rel > self.scanner.read_size && rel <= self.buf.len() {
                self.compact(rel - 1);
                continue;
            }
            if rel >= self.buf.len() && !self.eof {
                self.fill()?;
                continue;
            }
            if rel > self.buf.len() {
                return Ok(None);
            }

            let found = self.scanner.start.captures_at(&self.buf, rel).and_then(|caps| {
                let whole = caps.get(0)?;
                let date = caps.get(1).unwrap_or(whole);
                Some((whole.range(), date.range()))
            });

            if let Some((whole, date)) = found {
                // The match may continue into bytes not read yet.
                if whole.end == self.buf.len() && !self.eof {
                    self.fill()?;
                    continue;
                }
                let start = self.buf_start + whole.start as u64;
                let date_loc = Location::new(
                    (date.start - whole.start) as u64,
                    (date.end - whole.start) as u64,
                );
                self.search_from = self.buf_start + whole.end.max(whole.start + 1) as u64;
                return Ok(Some((start, date_loc)));
            }

            if self.eof {
                return Ok(None);
            }

            // No start in the buffer. Only its last MAX_START_LEN bytes can
            // still begin one once more data arrives.
            let keep = rel.max(self.buf.len().saturating_sub(MAX_START_LEN));
            self.search_from = self.buf_start + keep as u64;
            self.compact(keep.saturating_sub(1));
            self.fill()?;
        }
    }

    fn is_kept(&self, start: u64) -> bool {
        self.locations.iter().any(|l| l.contains(start))
    }

    fn close_pending(&mut self, end: u64, is_tail: bool) -> Option<MessageLayout> {
        let (from, date_loc) = self.pending.take()?;
        self.emitted = true;
        Some(MessageLayout {
            loc: Location::new(from, end),
            date_loc,
            is_tail,
        })
    }

    fn advance(&mut self) -> Result<Option<MessageLayout>> {
        while !self.done {
            match self.next_start()? {
                Some((start, _)) if start >= self.stop => {
                    self.done = true;
                    return Ok(self.close_pending(start, false));
                }
                Some((start, date_loc)) => {
                    let closed = self.close_pending(start, false);
                    if self.is_kept(start) {
                        self.pending = Some((start, date_loc));
                    }
                    if closed.is_some() {
                        return Ok(closed);
                    }
                }
                None => {
                    self.done = true;
                    let end = self.buf_start + self.buf.len() as u64;
                    return Ok(self.close_pending(end, true));
                }
            }
        }
        Ok(None)
    }
}

impl<R: Read> Iterator for Layouts<'_, R> {
    type Item = Result<MessageLayout>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(layout)) => {
                trace!(loc = %layout.loc, tail = layout.is_tail, "message boundary");
                Some(Ok(layout))
            }
            Ok(None) if !self.emitted && !self.reported_empty => {
                self.reported_empty = true;
                Some(Err(LogheapError::NoMessageStartFound))
            }
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                self.reported_empty = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const START: &str = r"(?m)^\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\]";

    fn scan_all(
        scanner: &BoundaryScanner,
        text: &[u8],
        locations: &[Location],
    ) -> Result<Vec<MessageLayout>> {
        scanner
            .scan(Cursor::new(text.to_vec()), text.len() as u64, locations)?
            .collect()
    }

    fn sample() -> Vec<u8> {
        let mut text = Vec::new();
        text.extend_from_slice(b"[2024-01-01 00:00:00] first message\n");
        text.extend_from_slice(b"[2024-01-01 00:00:01] second message\n  with a continuation\n");
        text.extend_from_slice(b"[2024-01-01 00:00:02] third\n");
        text
    }

    #[test]
    fn test_scan_whole_file() {
        let text = sample();
        let scanner = BoundaryScanner::new(START).unwrap();
        let layouts = scan_all(&scanner, &text, &[Location::new(0, text.len() as u64)]).unwrap();

        assert_eq!(layouts.len(), 3);
        assert_eq!(layouts[0].loc, Location::new(0, 36));
        assert_eq!(layouts[0].date_loc, Location::new(1, 20));
        assert!(!layouts[0].is_tail);
        assert_eq!(layouts[1].loc.from, 36);
        assert_eq!(layouts[2].loc.to, text.len() as u64);
        assert!(layouts[2].is_tail);

        let date = &text[layouts[1].date_abs().as_range()];
        assert_eq!(date, b"2024-01-01 00:00:01");
    }

    #[test]
    fn test_tiny_reads_match_large_reads() {
        let text = sample();
        let whole = [Location::new(0, text.len() as u64)];
        let big = BoundaryScanner::new(START).unwrap();
        let tiny = BoundaryScanner::new(START).unwrap().with_read_size(3);
        assert_eq!(
            scan_all(&big, &text, &whole).unwrap(),
            scan_all(&tiny, &text, &whole).unwrap()
        );
    }

    #[test]
    fn test_locations_filter_starts() {
        let text = sample();
        let scanner = BoundaryScanner::new(START).unwrap();

        // Window starts mid-message: the first kept start is the second message,
        // and the body runs past the window to the next start.
        let layouts = scan_all(&scanner, &text, &[Location::new(10, 40)]).unwrap();
        assert_eq!(layouts.len(), 1);
        assert_eq!(layouts[0].loc, Location::new(36, 95));
        assert!(!layouts[0].is_tail);
    }

    #[test]
    fn test_window_does_not_fake_line_start() {
        // A window opening right after "x" must not treat "[2024..." as a line start.
        let text = b"[2024-01-01 00:00:00] a x[2024-01-01 00:00:09] not a start\n";
        let scanner = BoundaryScanner::new(START).unwrap();
        let err = scan_all(&scanner, text, &[Location::new(25, text.len() as u64)]).unwrap_err();
        assert!(matches!(err, LogheapError::NoMessageStartFound));
    }

    #[test]
    fn test_no_message_start() {
        let text = b"just some text\nwithout dates\n";
        let scanner = BoundaryScanner::new(START).unwrap();
        let err = scan_all(&scanner, text, &[Location::new(0, text.len() as u64)]).unwrap_err();
        assert!(matches!(err, LogheapError::NoMessageStartFound));
    }

    #[test]
    fn test_file_size_bounds_the_read() {
        let text = sample();
        let scanner = BoundaryScanner::new(START).unwrap();
        // Pretend the file was 70 bytes long when it was stat-ed.
        let layouts: Vec<_> = scanner
            .scan(Cursor::new(text.clone()), 70, &[Location::new(0, 70)])
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(layouts.len(), 2);
        assert_eq!(layouts[1].loc, Location::new(36, 70));
        assert!(layouts[1].is_tail);
    }

    #[test]
    fn test_huge_message_keeps_buffer_small() {
        let mut text = b"[2024-01-01 00:00:00] ".to_vec();
        text.extend(std::iter::repeat(b'x').take(200_000));
        text.extend_from_slice(b"\n[2024-01-01 00:00:01] end\n");

        let scanner = BoundaryScanner::new(START).unwrap().with_read_size(1024);
        let mut layouts = scanner
            .scan(Cursor::new(text.clone()), text.len() as u64, &[Location::new(0, text.len() as u64)])
            .unwrap();
        let first = layouts.next().unwrap().unwrap();
        assert_eq!(first.loc, Location::new(0, 200_023));
        assert!(layouts.buf.capacity() < 64 * 1024);
    }

    #[test]
    fn test_rejects_empty_matching_pattern() {
        assert!(BoundaryScanner::new("(?m)^").is_err());
        assert!(BoundaryScanner::new("(").is_err());
    }
}
