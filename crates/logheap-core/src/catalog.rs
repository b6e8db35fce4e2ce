//! The relational side of storage: files, segments, messages and queries.
//!
//! [`Catalog`] is the contract ingestion and search are written against.
//! [`MemoryCatalog`] keeps every table in one `RwLock`-guarded structure that
//! is persisted as a snapshot.
//!
//! Message rows store only their start offset. Their end is the next row's
//! start in the same segment, or the segment end for the last row, so reads
//! resolve ends from segment order. Rows whose segment has no committed row
//! are orphans left by an interrupted commit; reads ignore them and
//! [`crate::segment::gc_orphans`] deletes them.

use crate::error::{LogheapError, Result};
use crate::location::Location;
use crate::types::{
    FileId, FileRecord, FoundMessage, Message, MessageRow, QueryId, QueryRecord, Segment,
    SegmentId, StoreStats,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Files added and removed by [`Catalog::upsert_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChanges {
    pub added: Vec<FileRecord>,
    pub removed: Vec<FileRecord>,
}

/// Relational storage contract.
///
/// `append_messages` and `append_results` are append primitives that callers
/// funnel through a single writer each.
pub trait Catalog: Send + Sync {
    // === Files ===
    fn list_files(&self) -> Result<Vec<FileRecord>>;

    /// Make the tracked file set equal `paths`. New paths get a record with
    /// size 0; vanished paths are wiped in cascade.
    fn upsert_files(&self, paths: &[PathBuf]) -> Result<FileChanges>;

    fn update_file_size(&self, file: FileId, size: u64) -> Result<()>;

    fn file(&self, file: FileId) -> Result<Option<FileRecord>>;

    fn file_by_path(&self, path: &Path) -> Result<Option<FileRecord>>;

    // === Segments ===
    /// Committed segment ranges per file, ordered by position.
    fn segments(&self) -> Result<BTreeMap<FileId, Vec<Location>>>;

    /// Every committed segment ordered by `(date_min, id)`.
    fn all_segments(&self) -> Result<Vec<Segment>>;

    /// Committed segments of one file ordered by position.
    fn file_segments(&self, file: FileId) -> Result<Vec<Segment>>;

    fn segment(&self, id: SegmentId) -> Result<Option<Segment>>;

    fn segment_ids(&self) -> Result<BTreeSet<SegmentId>>;

    /// The committed segment of `file` whose end is exactly `pos`.
    fn segment_adjoining(&self, file: FileId, pos: u64) -> Result<Option<Segment>>;

    /// Insert or replace a segment row.
    fn put_segment(&self, segment: Segment) -> Result<()>;

    fn max_segment_id(&self) -> Result<Option<SegmentId>>;

    /// Delete every segment of `file` with their messages. Returns the ids.
    fn wipe_segments(&self, file: FileId) -> Result<Vec<SegmentId>>;

    /// Delete a file with its segments, messages and query results.
    fn wipe_file(&self, file: FileId) -> Result<Vec<SegmentId>>;

    // === Messages ===
    /// Store message rows. A row replaces an earlier one with the same
    /// segment and start offset.
    fn append_messages(&self, rows: Vec<MessageRow>) -> Result<()>;

    /// Messages of `segments` (in the given segment order, then by offset)
    /// whose date lies within the bounds.
    fn messages(
        &self,
        segments: &[SegmentId],
        date_min: Option<DateTime<Utc>>,
        date_max: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;

    /// Messages still flagged as tails.
    fn tail_messages(&self) -> Result<Vec<Message>>;

    /// Record a re-scanned message end. When the message is the last of its
    /// segment the segment is extended (or shrunk) to `end` as well.
    fn update_message(&self, segment: SegmentId, from: u64, end: u64, is_tail: bool)
        -> Result<()>;

    /// Merge `absorbed` into `survivor`: re-point its messages, delete its
    /// row and extend the survivor over it, as one operation.
    fn absorb_segment(&self, survivor: SegmentId, absorbed: SegmentId) -> Result<Segment>;

    /// Segment ids referenced by message rows but not committed.
    fn orphan_message_segments(&self) -> Result<Vec<SegmentId>>;

    fn delete_messages_of(&self, segments: &[SegmentId]) -> Result<usize>;

    // === Queries ===
    fn create_query(
        &self,
        text: &str,
        date_min: Option<DateTime<Utc>>,
        date_max: Option<DateTime<Utc>>,
    ) -> Result<QueryRecord>;

    /// Every query record with the same text and bounds, oldest first.
    fn find_queries(
        &self,
        text: &str,
        date_min: Option<DateTime<Utc>>,
        date_max: Option<DateTime<Utc>>,
    ) -> Result<Vec<QueryRecord>>;

    fn append_results(&self, id: QueryId, results: Vec<FoundMessage>) -> Result<()>;

    fn finish_query(&self, id: QueryId, completed: bool) -> Result<()>;

    fn get_query(&self, id: QueryId) -> Result<QueryRecord>;

    fn list_queries(&self) -> Result<Vec<QueryRecord>>;

    fn query_results(&self, id: QueryId, skip: usize, limit: usize) -> Result<Vec<FoundMessage>>;

    fn delete_query(&self, id: QueryId) -> Result<()>;

    /// Delete query records created before `cutoff`. Returns how many.
    fn evict_queries(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // === Misc ===
    /// Counters over the catalog. `terms` is left at zero.
    fn stats(&self) -> Result<StoreStats>;
}

/// Serialized form of [`MemoryCatalog`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    files: BTreeMap<FileId, FileRecord>,
    next_file_id: u64,
    segments: BTreeMap<SegmentId, Segment>,
    /// Rows per segment id, ordered by start offset
    messages: BTreeMap<SegmentId, Vec<MessageRow>>,
    queries: BTreeMap<QueryId, QueryRecord>,
    next_query_id: u64,
    results: BTreeMap<QueryId, Vec<FoundMessage>>,
}

impl CatalogSnapshot {
    fn drop_segment(&mut self, id: SegmentId) {
        self.segments.remove(&id);
        self.messages.remove(&id);
    }

    fn resolve(&self, segment: &Segment) -> Vec<Message> {
        let Some(rows) = self.messages.get(&segment.id) else {
            return Vec::new();
        };
        let rows: Vec<&MessageRow> = rows
            .iter()
            .filter(|row| segment.loc.contains(row.from))
            .collect();

        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                let end = rows.get(i + 1).map_or(segment.loc.to, |next| next.from);
                Message {
                    segment: segment.id,
                    file: segment.file,
                    loc: Location::new(row.from, end),
                    date_loc: row.date_loc,
                    date: row.date,
                    is_tail: row.is_tail,
                }
            })
            .collect()
    }
}

/// In-memory catalog persisted through snapshots.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogSnapshot>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        MemoryCatalog {
            state: RwLock::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        self.state.read().clone()
    }

    pub fn clear(&self) {
        *self.state.write() = CatalogSnapshot::default();
    }
}

fn missing_segment(id: SegmentId) -> LogheapError {
    LogheapError::SegmentNotFound { id: id.as_u64() }
}

fn missing_query(id: QueryId) -> LogheapError {
    LogheapError::QueryNotFound { id: id.as_u64() }
}

fn wipe_file_locked(state: &mut CatalogSnapshot, file: FileId) -> Vec<SegmentId> {
    let ids: Vec<SegmentId> = state
        .segments
        .values()
        .filter(|s| s.file == file)
        .map(|s| s.id)
        .collect();
    for id in &ids {
        state.drop_segment(*id);
    }
    ids
}

impl Catalog for MemoryCatalog {
    fn list_files(&self) -> Result<Vec<FileRecord>> {
        Ok(self.state.read().files.values().cloned().collect())
    }

    fn upsert_files(&self, paths: &[PathBuf]) -> Result<FileChanges> {
        let wanted: BTreeSet<&PathBuf> = paths.iter().collect();
        let mut changes = FileChanges::default();

        let gone: Vec<FileRecord> = self
            .state
            .read()
            .files
            .values()
            .filter(|f| !wanted.contains(&f.path))
            .cloned()
            .collect();
        for record in gone {
            let segments = self.wipe_file(record.id)?;
            debug!(file = %record.path.display(), segments = segments.len(), "file removed");
            changes.removed.push(record);
        }

        let mut state = self.state.write();
        let known: BTreeSet<PathBuf> = state.files.values().map(|f| f.path.clone()).collect();
        for path in wanted {
            if known.contains(path) {
                continue;
            }
            state.next_file_id += 1;
            let record = FileRecord {
                id: FileId::new(state.next_file_id),
                path: path.clone(),
                size: 0,
            };
            state.files.insert(record.id, record.clone());
            changes.added.push(record);
        }

        Ok(changes)
    }

    fn update_file_size(&self, file: FileId, size: u64) -> Result<()> {
        if let Some(record) = self.state.write().files.get_mut(&file) {
            record.size = size;
        }
        Ok(())
    }

    fn file(&self, file: FileId) -> Result<Option<FileRecord>> {
        Ok(self.state.read().files.get(&file).cloned())
    }

    fn file_by_path(&self, path: &Path) -> Result<Option<FileRecord>> {
        Ok(self
            .state
            .read()
            .files
            .values()
            .find(|f| f.path == path)
            .cloned())
    }

    fn segments(&self) -> Result<BTreeMap<FileId, Vec<Location>>> {
        let state = self.state.read();
        let mut out: BTreeMap<FileId, Vec<Location>> = BTreeMap::new();
        for segment in state.segments.values() {
            out.entry(segment.file).or_default().push(segment.loc);
        }
        for locs in out.values_mut() {
            locs.sort_unstable();
        }
        Ok(out)
    }

    fn all_segments(&self) -> Result<Vec<Segment>> {
        let mut segments: Vec<Segment> = self.state.read().segments.values().cloned().collect();
        segments.sort_by_key(|s| (s.date_min, s.id));
        Ok(segments)
    }

    fn file_segments(&self, file: FileId) -> Result<Vec<Segment>> {
        let mut segments: Vec<Segment> = self
            .state
            .read()
            .segments
            .values()
            .filter(|s| s.file == file)
            .cloned()
            .collect();
        segments.sort_by_key(|s| s.loc);
        Ok(segments)
    }

    fn segment(&self, id: SegmentId) -> Result<Option<Segment>> {
        Ok(self.state.read().segments.get(&id).cloned())
    }

    fn segment_ids(&self) -> Result<BTreeSet<SegmentId>> {
        Ok(self.state.read().segments.keys().copied().collect())
    }

    fn segment_adjoining(&self, file: FileId, pos: u64) -> Result<Option<Segment>> {
        Ok(self
            .state
            .read()
            .segments
            .values()
            .find(|s| s.file == file && s.loc.to == pos)
            .cloned())
    }

    fn put_segment(&self, segment: Segment) -> Result<()> {
        self.state.write().segments.insert(segment.id, segment);
        Ok(())
    }

    fn max_segment_id(&self) -> Result<Option<SegmentId>> {
        Ok(self.state.read().segments.keys().next_back().copied())
    }

    fn wipe_segments(&self, file: FileId) -> Result<Vec<SegmentId>> {
        Ok(wipe_file_locked(&mut self.state.write(), file))
    }

    fn wipe_file(&self, file: FileId) -> Result<Vec<SegmentId>> {
        let mut state = self.state.write();
        let ids = wipe_file_locked(&mut state, file);
        state.files.remove(&file);
        for results in state.results.values_mut() {
            results.retain(|r| r.file != file);
        }
        Ok(ids)
    }

    fn append_messages(&self, rows: Vec<MessageRow>) -> Result<()> {
        let mut state = self.state.write();
        for row in rows {
            let list = state.messages.entry(row.segment).or_default();
            match list.binary_search_by_key(&row.from, |r| r.from) {
                Ok(pos) => list[pos] = row,
                Err(pos) => list.insert(pos, row),
            }
        }
        Ok(())
    }

    fn messages(
        &self,
        segments: &[SegmentId],
        date_min: Option<DateTime<Utc>>,
        date_max: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let state = self.state.read();
        let mut out = Vec::new();
        for id in segments {
            let Some(segment) = state.segments.get(id) else {
                continue;
            };
            out.extend(state.resolve(segment).into_iter().filter(|m| {
                date_min.map_or(true, |min| m.date >= min) && date_max.map_or(true, |max| m.date <= max)
            }));
        }
        Ok(out)
    }

    fn tail_messages(&self) -> Result<Vec<Message>> {
        let state = self.state.read();
        let mut out = Vec::new();
        for (id, rows) in &state.messages {
            if !rows.iter().any(|r| r.is_tail) {
                continue;
            }
            if let Some(segment) = state.segments.get(id) {
                out.extend(state.resolve(segment).into_iter().filter(|m| m.is_tail));
            }
        }
        Ok(out)
    }

    fn update_message(
        &self,
        segment: SegmentId,
        from: u64,
        end: u64,
        is_tail: bool,
    ) -> Result<()> {
        let mut state = self.state.write();
        let seg_loc = state
            .segments
            .get(&segment)
            .map(|s| s.loc)
            .ok_or_else(|| missing_segment(segment))?;

        let rows = state
            .messages
            .get_mut(&segment)
            .ok_or_else(|| missing_segment(segment))?;
        let pos = rows
            .binary_search_by_key(&from, |r| r.from)
            .map_err(|_| LogheapError::Internal(format!("no message at {from} in segment {segment}")))?;
        rows[pos].is_tail = is_tail;
        let is_last = rows[pos + 1..].iter().all(|r| !seg_loc.contains(r.from));

        if is_last {
            if let Some(seg) = state.segments.get_mut(&segment) {
                seg.loc = Location::new(seg.loc.from, end.max(from + 1));
            }
        }
        Ok(())
    }

    fn absorb_segment(&self, survivor: SegmentId, absorbed: SegmentId) -> Result<Segment> {
        let mut state = self.state.write();
        let gone = state
            .segments
            .remove(&absorbed)
            .ok_or_else(|| missing_segment(absorbed))?;
        let Some(keep) = state.segments.get_mut(&survivor) else {
            state.segments.insert(absorbed, gone);
            return Err(missing_segment(survivor));
        };

        keep.loc = Location::new(keep.loc.from.min(gone.loc.from), keep.loc.to.max(gone.loc.to));
        keep.date_min = keep.date_min.min(gone.date_min);
        keep.date_max = keep.date_max.max(gone.date_max);
        let merged = keep.clone();

        if let Some(rows) = state.messages.remove(&absorbed) {
            let list = state.messages.entry(survivor).or_default();
            for mut row in rows {
                row.segment = survivor;
                match list.binary_search_by_key(&row.from, |r| r.from) {
                    Ok(pos) => list[pos] = row,
                    Err(pos) => list.insert(pos, row),
                }
            }
        }
        Ok(merged)
    }

    fn orphan_message_segments(&self) -> Result<Vec<SegmentId>> {
        let state = self.state.read();
        Ok(state
            .messages
            .keys()
            .filter(|id| !state.segments.contains_key(id))
            .copied()
            .collect())
    }

    fn delete_messages_of(&self, segments: &[SegmentId]) -> Result<usize> {
        let mut state = self.state.write();
        Ok(segments
            .iter()
            .filter_map(|id| state.messages.remove(id))
            .map(|rows| rows.len())
            .sum())
    }

    fn create_query(
        &self,
        text: &str,
        date_min: Option<DateTime<Utc>>,
        date_max: Option<DateTime<Utc>>,
    ) -> Result<QueryRecord> {
        let mut state = self.state.write();
        state.next_query_id += 1;
        let record = QueryRecord {
            id: QueryId::new(state.next_query_id),
            text: text.to_string(),
            date_min,
            date_max,
            created_at: Utc::now(),
            finished: false,
            matched: 0,
        };
        state.queries.insert(record.id, record.clone());
        state.results.insert(record.id, Vec::new());
        Ok(record)
    }

    fn find_queries(
        &self,
        text: &str,
        date_min: Option<DateTime<Utc>>,
        date_max: Option<DateTime<Utc>>,
    ) -> Result<Vec<QueryRecord>> {
        Ok(self
            .state
            .read()
            .queries
            .values()
            .filter(|q| q.same_request(text, date_min, date_max))
            .cloned()
            .collect())
    }

    fn append_results(&self, id: QueryId, results: Vec<FoundMessage>) -> Result<()> {
        let mut state = self.state.write();
        let added = results.len() as u64;
        state
            .results
            .get_mut(&id)
            .ok_or_else(|| missing_query(id))?
            .extend(results);
        if let Some(record) = state.queries.get_mut(&id) {
            record.matched += added;
        }
        Ok(())
    }

    fn finish_query(&self, id: QueryId, completed: bool) -> Result<()> {
        let mut state = self.state.write();
        let record = state.queries.get_mut(&id).ok_or_else(|| missing_query(id))?;
        record.finished = completed;
        Ok(())
    }

    fn get_query(&self, id: QueryId) -> Result<QueryRecord> {
        self.state
            .read()
            .queries
            .get(&id)
            .cloned()
            .ok_or_else(|| missing_query(id))
    }

    fn list_queries(&self) -> Result<Vec<QueryRecord>> {
        Ok(self.state.read().queries.values().cloned().collect())
    }

    fn query_results(&self, id: QueryId, skip: usize, limit: usize) -> Result<Vec<FoundMessage>> {
        let state = self.state.read();
        let results = state.results.get(&id).ok_or_else(|| missing_query(id))?;
        Ok(results.iter().skip(skip).take(limit).cloned().collect())
    }

    fn delete_query(&self, id: QueryId) -> Result<()> {
        let mut state = self.state.write();
        state.queries.remove(&id).ok_or_else(|| missing_query(id))?;
        state.results.remove(&id);
        Ok(())
    }

    fn evict_queries(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write();
        let old: Vec<QueryId> = state
            .queries
            .values()
            .filter(|q| q.created_at < cutoff)
            .map(|q| q.id)
            .collect();
        for id in &old {
            state.queries.remove(id);
            state.results.remove(id);
        }
        Ok(old.len())
    }

    fn stats(&self) -> Result<StoreStats> {
        let state = self.state.read();
        let committed = state
            .messages
            .iter()
            .filter(|(id, _)| state.segments.contains_key(id))
            .flat_map(|(_, rows)| rows.iter());
        let (messages, tail_messages) =
            committed.fold((0, 0), |(all, tails), row| (all + 1, tails + row.is_tail as usize));

        Ok(StoreStats {
            files: state.files.len(),
            segments: state.segments.len(),
            messages,
            tail_messages,
            queries: state.queries.len(),
            terms: 0,
            indexed_bytes: state.segments.values().map(|s| s.loc.len()).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, sec).unwrap()
    }

    fn segment(id: u64, file: FileId, from: u64, to: u64) -> Segment {
        Segment {
            id: SegmentId::new(id),
            file,
            loc: Location::new(from, to),
            date_min: at(from as u32 % 60),
            date_max: at(to as u32 % 60),
        }
    }

    fn row(id: u64, from: u64, sec: u32) -> MessageRow {
        MessageRow {
            segment: SegmentId::new(id),
            from,
            date_loc: Location::new(0, 10),
            date: at(sec),
            is_tail: false,
        }
    }

    fn with_file() -> (MemoryCatalog, FileId) {
        let catalog = MemoryCatalog::new();
        let changes = catalog.upsert_files(&[PathBuf::from("/logs/a.log")]).unwrap();
        (catalog, changes.added[0].id)
    }

    #[test]
    fn test_upsert_files_adds_and_removes() {
        let catalog = MemoryCatalog::new();
        let a = PathBuf::from("/logs/a.log");
        let b = PathBuf::from("/logs/b.log");

        let changes = catalog.upsert_files(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(changes.added.len(), 2);
        assert!(changes.removed.is_empty());

        let file_b = catalog.file_by_path(&b).unwrap().unwrap().id;
        catalog.put_segment(segment(1, file_b, 0, 10)).unwrap();
        catalog.append_messages(vec![row(1, 0, 1)]).unwrap();
        let query = catalog.create_query("x", None, None).unwrap();
        catalog
            .append_results(
                query.id,
                vec![FoundMessage {
                    file: file_b,
                    loc: Location::new(0, 10),
                    date: at(1),
                }],
            )
            .unwrap();

        let changes = catalog.upsert_files(&[a.clone()]).unwrap();
        assert!(changes.added.is_empty());
        assert_eq!(changes.removed[0].path, b);
        assert!(catalog.segment(SegmentId::new(1)).unwrap().is_none());
        assert_eq!(catalog.stats().unwrap().messages, 0);
        assert_eq!(catalog.list_files().unwrap().len(), 1);
        assert!(catalog.query_results(query.id, 0, 10).unwrap().is_empty());

        // A known path keeps its id
        let again = catalog.upsert_files(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(again.added.len(), 1);
        assert_eq!(again.added[0].path, b);
        assert_ne!(again.added[0].id, file_b);
    }

    #[test]
    fn test_message_ends_resolved_from_order() {
        let (catalog, file) = with_file();
        catalog.put_segment(segment(1, file, 0, 90)).unwrap();
        catalog
            .append_messages(vec![row(1, 45, 2), row(1, 0, 1)])
            .unwrap();

        let messages = catalog.messages(&[SegmentId::new(1)], None, None).unwrap();
        let locs: Vec<Location> = messages.iter().map(|m| m.loc).collect();
        assert_eq!(locs, vec![Location::new(0, 45), Location::new(45, 90)]);

        let bounded = catalog
            .messages(&[SegmentId::new(1)], Some(at(2)), None)
            .unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].loc, Location::new(45, 90));
    }

    #[test]
    fn test_orphans_are_invisible() {
        let (catalog, file) = with_file();
        catalog.put_segment(segment(1, file, 0, 45)).unwrap();
        catalog.append_messages(vec![row(1, 0, 1), row(2, 45, 2)]).unwrap();

        let messages = catalog
            .messages(&[SegmentId::new(1), SegmentId::new(2)], None, None)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(catalog.orphan_message_segments().unwrap(), vec![SegmentId::new(2)]);
        assert_eq!(catalog.delete_messages_of(&[SegmentId::new(2)]).unwrap(), 1);
        assert!(catalog.orphan_message_segments().unwrap().is_empty());
    }

    #[test]
    fn test_segment_queries() {
        let (catalog, file) = with_file();
        let mut late = segment(1, file, 50, 100);
        late.date_min = at(30);
        let mut early = segment(2, file, 0, 50);
        early.date_min = at(10);
        catalog.put_segment(late).unwrap();
        catalog.put_segment(early).unwrap();

        let order: Vec<u64> = catalog
            .all_segments()
            .unwrap()
            .iter()
            .map(|s| s.id.as_u64())
            .collect();
        assert_eq!(order, vec![2, 1]);
        assert_eq!(
            catalog.segments().unwrap()[&file],
            vec![Location::new(0, 50), Location::new(50, 100)]
        );
        assert_eq!(
            catalog.segment_adjoining(file, 100).unwrap().unwrap().id,
            SegmentId::new(1)
        );
        assert!(catalog.segment_adjoining(file, 75).unwrap().is_none());
        assert_eq!(catalog.max_segment_id().unwrap(), Some(SegmentId::new(2)));
    }

    #[test]
    fn test_absorb_segment() {
        let (catalog, file) = with_file();
        catalog.put_segment(segment(1, file, 0, 10)).unwrap();
        catalog.put_segment(segment(2, file, 10, 25)).unwrap();
        catalog.append_messages(vec![row(1, 0, 1), row(2, 10, 2)]).unwrap();

        let merged = catalog
            .absorb_segment(SegmentId::new(1), SegmentId::new(2))
            .unwrap();
        assert_eq!(merged.loc, Location::new(0, 25));
        assert!(catalog.segment(SegmentId::new(2)).unwrap().is_none());

        let messages = catalog.messages(&[SegmentId::new(1)], None, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].loc, Location::new(10, 25));

        let err = catalog
            .absorb_segment(SegmentId::new(1), SegmentId::new(9))
            .unwrap_err();
        assert!(matches!(err, LogheapError::SegmentNotFound { id: 9 }));
    }

    #[test]
    fn test_update_tail_message_extends_segment() {
        let (catalog, file) = with_file();
        catalog.put_segment(segment(1, file, 0, 70)).unwrap();
        let mut tail = row(1, 45, 2);
        tail.is_tail = true;
        catalog.append_messages(vec![row(1, 0, 1), tail]).unwrap();

        let tails = catalog.tail_messages().unwrap();
        assert_eq!(tails.len(), 1);
        assert_eq!(tails[0].loc, Location::new(45, 70));

        catalog.update_message(SegmentId::new(1), 45, 90, false).unwrap();
        assert!(catalog.tail_messages().unwrap().is_empty());
        assert_eq!(
            catalog.segment(SegmentId::new(1)).unwrap().unwrap().loc,
            Location::new(0, 90)
        );
    }

    #[test]
    fn test_query_lifecycle() {
        let (catalog, file) = with_file();
        let record = catalog.create_query("error", None, None).unwrap();
        catalog.create_query("other", None, None).unwrap();

        let found = |from| FoundMessage {
            file,
            loc: Location::new(from, from + 5),
            date: at(1),
        };
        catalog
            .append_results(record.id, vec![found(0), found(5), found(10)])
            .unwrap();
        catalog.finish_query(record.id, true).unwrap();

        let stored = catalog.get_query(record.id).unwrap();
        assert!(stored.finished);
        assert_eq!(stored.matched, 3);
        let same = catalog.find_queries("error", None, None).unwrap();
        assert_eq!(same.iter().map(|q| q.id).collect::<Vec<_>>(), vec![record.id]);
        assert!(catalog.find_queries("error", Some(at(0)), None).unwrap().is_empty());

        let page = catalog.query_results(record.id, 1, 10).unwrap();
        assert_eq!(page, vec![found(5), found(10)]);

        catalog.delete_query(record.id).unwrap();
        assert!(matches!(
            catalog.get_query(record.id),
            Err(LogheapError::QueryNotFound { .. })
        ));
    }

    #[test]
    fn test_evict_queries() {
        let catalog = MemoryCatalog::new();
        catalog.create_query("a", None, None).unwrap();
        catalog.create_query("b", None, None).unwrap();

        assert_eq!(catalog.evict_queries(Utc::now() - chrono::Duration::hours(1)).unwrap(), 0);
        assert_eq!(
            catalog
                .evict_queries(Utc::now() + chrono::Duration::seconds(1))
                .unwrap(),
            2
        );
        assert!(catalog.list_queries().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_counters() {
        let (catalog, file) = with_file();
        catalog.put_segment(segment(4, file, 0, 10)).unwrap();
        let restored = MemoryCatalog::from_snapshot(catalog.snapshot());

        assert_eq!(restored.max_segment_id().unwrap(), Some(SegmentId::new(4)));
        let changes = restored
            .upsert_files(&[PathBuf::from("/logs/a.log"), PathBuf::from("/logs/c.log")])
            .unwrap();
        assert_eq!(changes.added[0].id, FileId::new(2));
    }
}
