//! Grouping scanned messages into committed segments.
//!
//! A [`SegmentBuilder`] receives the messages of one ingestion task in file
//! order. It keeps one open segment, resuming a committed segment that ends
//! exactly where the first message starts, and starts a fresh one once the
//! open segment has grown past `segment_size`.
//!
//! Flushing writes in a fixed order: message rows (already appended, made
//! visible by a flush barrier), then postings, then the segment row. A crash
//! in between leaves rows and postings under a segment id with no committed
//! row, which [`gc_orphans`] removes.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::postings::PostingStore;
use crate::types::{FileId, MessageLayout, MessageRow, Segment, SegmentId};
use crate::writer::Appender;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info};

/// Monotonic segment id source owned by the committer.
#[derive(Debug)]
pub struct SegmentIds {
    next: u64,
}

impl SegmentIds {
    /// Continue after the largest committed id.
    pub fn resume(catalog: &dyn Catalog) -> Result<Self> {
        let next = catalog.max_segment_id()?.map_or(1, |id| id.as_u64() + 1);
        Ok(SegmentIds { next })
    }

    pub fn next(&mut self) -> SegmentId {
        let id = SegmentId::new(self.next);
        self.next += 1;
        id
    }
}

/// The stores a commit writes to.
pub struct CommitContext<'a> {
    pub catalog: &'a dyn Catalog,
    pub postings: &'a dyn PostingStore,
    pub messages: &'a Appender<MessageRow>,
}

/// What one builder committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Segment rows written, new or resumed
    pub segments: usize,
    pub messages: usize,
}

struct OpenSegment {
    segment: Segment,
    terms: HashSet<String>,
    messages: usize,
}

/// Builds the segments of one ingestion task.
pub struct SegmentBuilder<'a> {
    file: FileId,
    segment_size: u64,
    ctx: &'a CommitContext<'a>,
    ids: &'a mut SegmentIds,
    open: Option<OpenSegment>,
    started: bool,
    report: BuildReport,
}

impl<'a> SegmentBuilder<'a> {
    pub fn new(
        file: FileId,
        segment_size: u64,
        ctx: &'a CommitContext<'a>,
        ids: &'a mut SegmentIds,
    ) -> Self {
        SegmentBuilder {
            file,
            segment_size,
            ctx,
            ids,
            open: None,
            started: false,
            report: BuildReport::default(),
        }
    }

    /// Add the next message of the task.
    pub fn accept(
        &mut self,
        layout: &MessageLayout,
        date: DateTime<Utc>,
        terms: HashSet<String>,
    ) -> Result<()> {
        if !self.started {
            self.started = true;
            if let Some(segment) = self.ctx.catalog.segment_adjoining(self.file, layout.loc.from)? {
                debug!(segment = %segment.id, loc = %segment.loc, "resuming adjoining segment");
                self.open = Some(OpenSegment {
                    segment,
                    terms: HashSet::new(),
                    messages: 0,
                });
            }
        }

        let full = self
            .open
            .as_ref()
            .map_or(false, |open| open.segment.loc.len() > self.segment_size);
        if full {
            self.flush()?;
        }

        let file = self.file;
        let ids = &mut *self.ids;
        let open = self.open.get_or_insert_with(|| OpenSegment {
            segment: Segment {
                id: ids.next(),
                file,
                loc: layout.loc,
                date_min: date,
                date_max: date,
            },
            terms: HashSet::new(),
            messages: 0,
        });

        open.segment.loc.to = layout.loc.to;
        open.segment.date_min = open.segment.date_min.min(date);
        open.segment.date_max = open.segment.date_max.max(date);
        open.terms.extend(terms);
        open.messages += 1;
        let segment = open.segment.id;

        self.ctx.messages.append(MessageRow {
            segment,
            from: layout.loc.from,
            date_loc: layout.date_loc,
            date,
            is_tail: layout.is_tail,
        })
    }

    fn flush(&mut self) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        if open.messages == 0 {
            return Ok(());
        }

        self.ctx.messages.flush()?;
        self.ctx.postings.put(&open.terms, open.segment.id)?;
        self.ctx.catalog.put_segment(open.segment.clone())?;

        debug!(
            segment = %open.segment.id,
            loc = %open.segment.loc,
            messages = open.messages,
            terms = open.terms.len(),
            "segment committed"
        );
        self.report.segments += 1;
        self.report.messages += open.messages;
        Ok(())
    }

    /// Flush the open segment.
    pub fn finish(mut self) -> Result<BuildReport> {
        self.flush()?;
        Ok(self.report)
    }
}

/// Merge runs of small adjoining segments of each file.
///
/// Two neighbours merge when both are at most `segment_size` long, the first
/// ends where the second starts and the result stays within
/// `1.5 × segment_size`. Returns the number of segments absorbed.
pub fn merge_small_segments(
    catalog: &dyn Catalog,
    postings: &dyn PostingStore,
    segment_size: u64,
) -> Result<usize> {
    let ceiling = segment_size.saturating_mul(3) / 2;
    let mut merged = 0;

    for file in catalog.list_files()? {
        let mut segments = catalog.file_segments(file.id)?.into_iter();
        let Some(mut current) = segments.next() else {
            continue;
        };

        for next in segments {
            let fits = current.loc.len() <= segment_size
                && next.loc.len() <= segment_size
                && current.loc.to == next.loc.from
                && next.loc.to - current.loc.from <= ceiling;

            if !fits {
                current = next;
                continue;
            }

            postings.reassign(next.id, current.id)?;
            current = catalog.absorb_segment(current.id, next.id)?;
            merged += 1;
            debug!(
                file = %file.path.display(),
                survivor = %current.id,
                absorbed = %next.id,
                loc = %current.loc,
                "segments merged"
            );
        }
    }

    if merged > 0 {
        info!(merged, "merged small segments");
    }
    Ok(merged)
}

/// What [`gc_orphans`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub messages: usize,
    pub posting_segments: usize,
}

/// Delete message rows and postings whose segment was never committed.
pub fn gc_orphans(catalog: &dyn Catalog, postings: &dyn PostingStore) -> Result<GcReport> {
    let orphans = catalog.orphan_message_segments()?;
    let messages = catalog.delete_messages_of(&orphans)?;

    let committed = catalog.segment_ids()?;
    let posting_segments = postings.retain_segments(&|id| committed.contains(&id))?;

    let report = GcReport {
        messages,
        posting_segments,
    };
    if report != GcReport::default() {
        info!(
            messages = report.messages,
            posting_segments = report.posting_segments,
            "removed orphan rows"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::location::Location;
    use crate::postings::MemoryPostings;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, sec).unwrap()
    }

    fn layout(from: u64, to: u64) -> MessageLayout {
        MessageLayout {
            loc: Location::new(from, to),
            date_loc: Location::new(1, 20),
            is_tail: false,
        }
    }

    fn terms(words: &[&str]) -> HashSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn build(
        catalog: &Arc<MemoryCatalog>,
        postings: &MemoryPostings,
        file: FileId,
        segment_size: u64,
        messages: &[(u64, u64, &str)],
    ) -> BuildReport {
        let sink_catalog = catalog.clone();
        let appender = Appender::spawn("messages", 16, Duration::from_secs(3600), move |rows| {
            sink_catalog.append_messages(rows)
        })
        .unwrap();
        let ctx = CommitContext {
            catalog: catalog.as_ref(),
            postings,
            messages: &appender,
        };
        let mut ids = SegmentIds::resume(catalog.as_ref()).unwrap();
        let mut builder = SegmentBuilder::new(file, segment_size, &ctx, &mut ids);
        for (i, (from, to, word)) in messages.iter().enumerate() {
            builder
                .accept(&layout(*from, *to), at(i as u32), terms(&[*word]))
                .unwrap();
        }
        builder.finish().unwrap()
    }

    fn shared() -> (Arc<MemoryCatalog>, MemoryPostings, FileId) {
        let catalog = MemoryCatalog::new();
        let file = catalog
            .upsert_files(&[PathBuf::from("/logs/app.log")])
            .unwrap()
            .added[0]
            .id;
        (Arc::new(catalog), MemoryPostings::new(), file)
    }

    #[test]
    fn test_segments_split_past_size() {
        let (catalog, postings, file) = shared();
        let report = build(
            &catalog,
            &postings,
            file,
            80,
            &[(0, 45, "alpha"), (45, 90, "bravo"), (90, 135, "charlie")],
        );
        assert_eq!(report, BuildReport { segments: 2, messages: 3 });
        assert_eq!(
            catalog.segments().unwrap()[&file],
            vec![Location::new(0, 90), Location::new(90, 135)]
        );

        let found = postings.prefix_search(&["bravo".to_string()]).unwrap();
        assert_eq!(found["bravo"].len(), 1);
        assert_eq!(catalog.stats().unwrap().messages, 3);
    }

    #[test]
    fn test_resume_adjoining_segment() {
        let (catalog, postings, file) = shared();
        build(&catalog, &postings, file, 80, &[(0, 45, "alpha")]);
        build(&catalog, &postings, file, 80, &[(45, 90, "bravo")]);

        let segments = catalog.file_segments(file).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].loc, Location::new(0, 90));

        // Postings of the resumed segment gain the new terms
        let found = postings.prefix_search(&["bravo".to_string()]).unwrap();
        assert!(found["bravo"].contains(&segments[0].id));
    }

    #[test]
    fn test_ids_resume_after_max() {
        let (catalog, postings, file) = shared();
        build(&catalog, &postings, file, 10, &[(0, 45, "alpha"), (45, 90, "bravo")]);
        let mut ids = SegmentIds::resume(catalog.as_ref()).unwrap();
        assert_eq!(ids.next(), SegmentId::new(3));
        assert_eq!(ids.next(), SegmentId::new(4));
    }

    #[test]
    fn test_empty_task_creates_nothing() {
        let (catalog, postings, file) = shared();
        let report = build(&catalog, &postings, file, 80, &[]);
        assert_eq!(report, BuildReport::default());
        assert!(catalog.all_segments().unwrap().is_empty());
    }

    #[test]
    fn test_merge_small_segments() {
        let (catalog, postings, file) = shared();
        // One message per segment: every segment exceeds a size of 5
        build(
            &catalog,
            &postings,
            file,
            5,
            &[(0, 10, "alpha"), (10, 20, "bravo"), (20, 30, "charlie")],
        );
        assert_eq!(catalog.file_segments(file).unwrap().len(), 3);

        let merged = merge_small_segments(catalog.as_ref(), &postings, 15).unwrap();
        assert_eq!(merged, 1);

        let segments = catalog.file_segments(file).unwrap();
        let locs: Vec<Location> = segments.iter().map(|s| s.loc).collect();
        assert_eq!(locs, vec![Location::new(0, 20), Location::new(20, 30)]);

        let found = postings
            .prefix_search(&["alpha".to_string(), "bravo".to_string()])
            .unwrap();
        assert_eq!(found["alpha"], found["bravo"]);
        assert!(found["bravo"].contains(&segments[0].id));
        assert_eq!(catalog.messages(&[segments[0].id], None, None).unwrap().len(), 2);
    }

    #[test]
    fn test_merge_skips_gaps() {
        let (catalog, postings, file) = shared();
        build(&catalog, &postings, file, 5, &[(0, 10, "alpha")]);
        build(&catalog, &postings, file, 5, &[(12, 20, "bravo")]);

        assert_eq!(merge_small_segments(catalog.as_ref(), &postings, 100).unwrap(), 0);
    }

    #[test]
    fn test_gc_orphans() {
        let (catalog, postings, file) = shared();
        build(&catalog, &postings, file, 80, &[(0, 45, "alpha")]);

        // An interrupted commit: rows and postings without a segment row
        catalog
            .append_messages(vec![MessageRow {
                segment: SegmentId::new(99),
                from: 45,
                date_loc: Location::new(1, 20),
                date: at(1),
                is_tail: false,
            }])
            .unwrap();
        postings.put(&terms(&["ghost"]), SegmentId::new(99)).unwrap();

        let report = gc_orphans(catalog.as_ref(), &postings).unwrap();
        assert_eq!(
            report,
            GcReport {
                messages: 1,
                posting_segments: 1
            }
        );
        assert!(catalog.orphan_message_segments().unwrap().is_empty());
        assert_eq!(postings.term_count(), 1);
    }
}
