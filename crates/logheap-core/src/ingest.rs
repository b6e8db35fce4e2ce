//! The ingestion pipeline.
//!
//! One run goes through `Discover -> ProduceTasks -> WorkerPool -> Commit`:
//!
//! 1. Discover globs the configured patterns, reconciles the tracked files
//!    and computes the byte ranges of each file no committed segment covers.
//!    Those ranges are split into tasks of at most `segment_size` bytes.
//! 2. A producer thread feeds tasks through a bounded channel, skipping
//!    files that already failed in this run.
//! 3. Worker threads scan each task's range for messages, parse their dates
//!    and extract terms.
//! 4. The calling thread commits. It puts each file's results back in task
//!    order before building segments, so segment ids within a file grow with
//!    offset.
//!
//! A fault in one file (I/O, unparsable date) drops that file for the rest of
//! the run without affecting others; the next run retries it from committed
//! state. Runs are not cancellable: whatever was committed is a valid place
//! for the next run to resume from.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::date::DateFormat;
use crate::error::{LogheapError, Result};
use crate::location::{exclude_locations, Location};
use crate::postings::PostingStore;
use crate::scanner::BoundaryScanner;
use crate::segment::{gc_orphans, CommitContext, SegmentBuilder, SegmentIds};
use crate::tokenizer::Tokenizer;
use crate::types::{FileId, FileRecord, Message, MessageLayout, MessageRow};
use crate::writer::Appender;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashSet;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

const MESSAGE_QUEUE: usize = 4096;
const MESSAGE_FLUSH_EVERY: Duration = Duration::from_millis(500);

/// Summary of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub files_added: usize,
    pub files_removed: usize,
    /// Files that shrank and were re-indexed from the start
    pub files_rotated: usize,
    pub tasks: usize,
    pub failed_files: Vec<PathBuf>,
    /// Segment rows written, new or resumed
    pub segments: usize,
    pub messages: usize,
    pub tails_corrected: usize,
}

#[derive(Debug, Clone)]
struct Task {
    file: FileId,
    path: PathBuf,
    /// File size at discovery; nothing past it is read
    size: u64,
    loc: Location,
    /// Position among this file's tasks
    seq: usize,
}

struct ScannedMessage {
    layout: MessageLayout,
    date: DateTime<Utc>,
    terms: HashSet<String>,
}

enum Outcome {
    Scanned(Vec<ScannedMessage>),
    /// No message starts in the task range
    Empty,
    /// A fault of this file; the rest of it waits for the next run
    Failed(LogheapError),
    /// Not a file fault; aborts the run
    Fatal(LogheapError),
}

impl Outcome {
    fn of(scanned: Result<Vec<ScannedMessage>>) -> Self {
        match scanned {
            Ok(scanned) if scanned.is_empty() => Outcome::Empty,
            Ok(scanned) => Outcome::Scanned(scanned),
            Err(e) if e.blacklists_file() => Outcome::Failed(e),
            Err(e) if e.is_recoverable() => Outcome::Empty,
            Err(e) => Outcome::Fatal(e),
        }
    }
}

struct TaskResult {
    task: Task,
    outcome: Outcome,
}

/// Runs ingestion against a catalog and posting store.
pub struct Ingestor {
    catalog: Arc<dyn Catalog>,
    postings: Arc<dyn PostingStore>,
    scanner: BoundaryScanner,
    tokenizer: Tokenizer,
    date_format: DateFormat,
    patterns: Vec<String>,
    segment_size: u64,
    concurrency: usize,
}

impl Ingestor {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        postings: Arc<dyn PostingStore>,
        config: &Config,
    ) -> Result<Self> {
        Ok(Ingestor {
            catalog,
            postings,
            scanner: config.scanner()?,
            tokenizer: config.tokenizer()?,
            date_format: config.date_format(),
            patterns: config.ingest.files.clone(),
            segment_size: config.ingest.segment_size.max(1),
            concurrency: config.ingest_concurrency(),
        })
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Run one full ingestion pass.
    #[instrument(skip(self))]
    pub fn run(&self) -> Result<IngestReport> {
        let started = Instant::now();
        gc_orphans(self.catalog.as_ref(), self.postings.as_ref())?;

        let mut report = IngestReport::default();
        let files = self.discover(&mut report)?;
        report.tails_corrected = self.correct_tails()?;

        let tasks = self.plan_tasks(&files)?;
        report.tasks = tasks.len();
        if tasks.is_empty() {
            debug!("nothing to ingest");
            return Ok(report);
        }

        let sink_catalog = self.catalog.clone();
        let messages: Appender<MessageRow> =
            Appender::spawn("messages", MESSAGE_QUEUE, MESSAGE_FLUSH_EVERY, move |rows| {
                sink_catalog.append_messages(rows)
            })?;

        let committed = self.execute(tasks, &messages, &mut report);
        let closed = messages.close();
        committed?;
        closed?;

        info!(
            files = files.len(),
            tasks = report.tasks,
            segments = report.segments,
            messages = report.messages,
            failed = report.failed_files.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingestion run finished"
        );
        Ok(report)
    }

    /// Reconcile tracked files with the filesystem. Returns the files present
    /// now, with their current sizes.
    fn discover(&self, report: &mut IngestReport) -> Result<Vec<FileRecord>> {
        let mut paths = BTreeSet::new();
        for pattern in &self.patterns {
            let entries = glob::glob(pattern).map_err(|e| LogheapError::ConfigError {
                reason: format!("bad glob {pattern:?}: {e}"),
            })?;
            for entry in entries {
                match entry {
                    Ok(path) => {
                        paths.insert(path);
                    }
                    Err(e) => warn!(error = %e, "skipping unreadable glob match"),
                }
            }
        }

        let present: Vec<(PathBuf, u64)> = paths
            .into_iter()
            .collect::<Vec<_>>()
            .into_par_iter()
            .filter_map(|path| match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => Some((path, meta.len())),
                Ok(_) => None,
                Err(e) => {
                    debug!(file = %path.display(), error = %e, "cannot stat file");
                    None
                }
            })
            .collect();

        let names: Vec<PathBuf> = present.iter().map(|(path, _)| path.clone()).collect();
        let changes = self.catalog.upsert_files(&names)?;
        report.files_added = changes.added.len();
        report.files_removed = changes.removed.len();
        for record in &changes.removed {
            info!(file = %record.path.display(), "file is gone, dropped from the index");
        }

        let records: HashMap<PathBuf, FileRecord> = self
            .catalog
            .list_files()?
            .into_iter()
            .map(|f| (f.path.clone(), f))
            .collect();
        let extents = self.catalog.segments()?;

        let mut files = Vec::with_capacity(present.len());
        for (path, size) in present {
            let Some(mut record) = records.get(&path).cloned() else {
                continue;
            };
            let extent = extents
                .get(&record.id)
                .and_then(|locs| locs.last())
                .map_or(0, |loc| loc.to);
            if size < extent {
                warn!(
                    file = %path.display(),
                    size,
                    indexed = extent,
                    "file shrank, re-indexing from the start"
                );
                self.catalog.wipe_segments(record.id)?;
                report.files_rotated += 1;
            }
            self.catalog.update_file_size(record.id, size)?;
            record.size = size;
            files.push(record);
        }

        if report.files_rotated > 0 || report.files_removed > 0 {
            let committed = self.catalog.segment_ids()?;
            self.postings
                .retain_segments(&|id| committed.contains(&id))?;
        }

        files.sort_by_key(|f| f.id);
        Ok(files)
    }

    /// Split the unindexed ranges of each file into tasks.
    fn plan_tasks(&self, files: &[FileRecord]) -> Result<Vec<Task>> {
        let committed = self.catalog.segments()?;
        let mut tasks = Vec::new();

        for file in files {
            let covered = committed.get(&file.id).map(Vec::as_slice).unwrap_or(&[]);
            let gaps = exclude_locations(Location::new(0, file.size), covered);
            let chunks = gaps.iter().flat_map(|gap| gap.split(self.segment_size));
            for (seq, loc) in chunks.enumerate() {
                tasks.push(Task {
                    file: file.id,
                    path: file.path.clone(),
                    size: file.size,
                    loc,
                    seq,
                });
            }
        }
        Ok(tasks)
    }

    fn execute(
        &self,
        tasks: Vec<Task>,
        messages: &Appender<MessageRow>,
        report: &mut IngestReport,
    ) -> Result<()> {
        let blacklist: DashSet<FileId> = DashSet::new();
        let blacklist = &blacklist;
        let workers = self.concurrency.max(1);
        let (task_tx, task_rx) = bounded::<Task>(workers * 2);
        let (result_tx, result_rx) = bounded::<TaskResult>(workers * 2);

        thread::scope(|scope| {
            thread::Builder::new()
                .name("logheap-ingest-producer".to_string())
                .spawn_scoped(scope, move || produce(tasks, task_tx, blacklist))?;

            for i in 0..workers {
                let rx = task_rx.clone();
                let tx = result_tx.clone();
                thread::Builder::new()
                    .name(format!("logheap-ingest-{i}"))
                    .spawn_scoped(scope, move || Worker::new(self).run(rx, tx, blacklist))?;
            }
            drop(task_rx);
            drop(result_tx);

            self.commit(result_rx, messages, blacklist, report)
        })
    }

    /// Apply worker results in per-file task order.
    fn commit(
        &self,
        results: Receiver<TaskResult>,
        messages: &Appender<MessageRow>,
        blacklist: &DashSet<FileId>,
        report: &mut IngestReport,
    ) -> Result<()> {
        struct FileQueue {
            next: usize,
            waiting: BTreeMap<usize, TaskResult>,
            dead: bool,
        }

        let ctx = CommitContext {
            catalog: self.catalog.as_ref(),
            postings: self.postings.as_ref(),
            messages,
        };
        let mut ids = SegmentIds::resume(self.catalog.as_ref())?;
        let mut queues: HashMap<FileId, FileQueue> = HashMap::new();

        for result in results {
            let queue = queues.entry(result.task.file).or_insert_with(|| FileQueue {
                next: 0,
                waiting: BTreeMap::new(),
                dead: false,
            });
            if queue.dead {
                continue;
            }
            queue.waiting.insert(result.task.seq, result);

            while let Some(ready) = queue.waiting.remove(&queue.next) {
                queue.next += 1;
                let task = ready.task;
                match ready.outcome {
                    Outcome::Scanned(scanned) => {
                        let mut builder =
                            SegmentBuilder::new(task.file, self.segment_size, &ctx, &mut ids);
                        for message in scanned {
                            builder.accept(&message.layout, message.date, message.terms)?;
                        }
                        let built = builder.finish()?;
                        report.segments += built.segments;
                        report.messages += built.messages;
                    }
                    Outcome::Empty => {
                        trace!(file = %task.path.display(), loc = %task.loc, "no message start in range");
                    }
                    Outcome::Failed(e) => {
                        warn!(
                            file = %task.path.display(),
                            loc = %task.loc,
                            error = %e,
                            "ingestion failed, file skipped until the next run"
                        );
                        blacklist.insert(task.file);
                        report.failed_files.push(task.path);
                        queue.dead = true;
                        queue.waiting.clear();
                        break;
                    }
                    Outcome::Fatal(e) => {
                        error!(file = %task.path.display(), loc = %task.loc, error = %e, "ingestion aborted");
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-scan messages flagged as tails whose file has grown since.
    ///
    /// A message that now ends elsewhere gets its extent, its segment end and
    /// its segment's terms updated. The tail flag is cleared once a following
    /// message start is seen. Returns the number of messages changed.
    pub fn correct_tails(&self) -> Result<usize> {
        let mut corrected = 0;
        let mut files: HashMap<FileId, Option<FileRecord>> = HashMap::new();

        for message in self.catalog.tail_messages()? {
            let record = match files.get(&message.file) {
                Some(record) => record.clone(),
                None => {
                    let record = self.catalog.file(message.file)?;
                    files.insert(message.file, record.clone());
                    record
                }
            };
            let Some(record) = record else {
                continue;
            };

            match self.correct_tail(&record.path, &message) {
                Ok(true) => corrected += 1,
                Ok(false) => {}
                Err(e) if e.is_recoverable() || e.blacklists_file() => warn!(
                    file = %record.path.display(),
                    loc = %message.loc,
                    error = %e,
                    "tail correction failed"
                ),
                Err(e) => return Err(e),
            }
        }

        if corrected > 0 {
            info!(corrected, "tail messages corrected");
        }
        Ok(corrected)
    }

    fn correct_tail(&self, path: &Path, message: &Message) -> Result<bool> {
        let Some(segment) = self.catalog.segment(message.segment)? else {
            return Ok(false);
        };
        let size = fs::metadata(path)?.len();
        if segment.loc.to != message.loc.to || size <= message.loc.to {
            return Ok(false);
        }

        let from = message.loc.from;
        let layouts = self
            .scanner
            .scan_file(path, size, &[Location::new(from, from + 1)])?;
        let Some(layout) = layouts.first().filter(|l| l.loc.from == from) else {
            warn!(file = %path.display(), from, "tail message start moved, skipping");
            return Ok(false);
        };

        if layout.loc.to != message.loc.to {
            let mut file = File::open(path)?;
            let mut body = Vec::new();
            read_at(&mut file, layout.loc, &mut body)?;
            let terms = self.tokenizer.index_terms(&message.date_loc.excise(&body));
            self.postings.put(&terms, message.segment)?;
        }
        if layout.loc.to == message.loc.to && layout.is_tail {
            return Ok(false);
        }

        self.catalog
            .update_message(message.segment, from, layout.loc.to, layout.is_tail)?;
        debug!(
            file = %path.display(),
            from,
            old_end = message.loc.to,
            new_end = layout.loc.to,
            tail = layout.is_tail,
            "tail message re-scanned"
        );
        Ok(true)
    }
}

fn produce(tasks: Vec<Task>, tx: Sender<Task>, blacklist: &DashSet<FileId>) {
    for task in tasks {
        if blacklist.contains(&task.file) {
            trace!(file = %task.path.display(), loc = %task.loc, "skipping task of failed file");
            continue;
        }
        if tx.send(task).is_err() {
            break;
        }
    }
}

fn read_at(file: &mut File, loc: Location, buf: &mut Vec<u8>) -> Result<()> {
    buf.clear();
    buf.resize(loc.len() as usize, 0);
    file.seek(SeekFrom::Start(loc.from))?;
    file.read_exact(buf)?;
    Ok(())
}

/// Scans tasks, keeping the last file open and reusing one read buffer.
struct Worker<'a> {
    ingestor: &'a Ingestor,
    open: Option<(FileId, File)>,
    buf: Vec<u8>,
}

impl<'a> Worker<'a> {
    fn new(ingestor: &'a Ingestor) -> Self {
        Worker {
            ingestor,
            open: None,
            buf: Vec::new(),
        }
    }

    fn run(mut self, tasks: Receiver<Task>, results: Sender<TaskResult>, blacklist: &DashSet<FileId>) {
        for task in tasks {
            let outcome = Outcome::of(self.scan(&task));
            if let Outcome::Failed(_) | Outcome::Fatal(_) = outcome {
                self.open = None;
            }
            if let Outcome::Failed(_) = outcome {
                blacklist.insert(task.file);
            }
            if results.send(TaskResult { task, outcome }).is_err() {
                break;
            }
        }
    }

    fn scan(&mut self, task: &Task) -> Result<Vec<ScannedMessage>> {
        let reopen = !matches!(&self.open, Some((id, _)) if *id == task.file);
        if reopen {
            self.open = None;
            self.open = Some((task.file, File::open(&task.path)?));
        }
        let Some((_, file)) = self.open.as_mut() else {
            return Err(LogheapError::Internal("worker lost its file handle".to_string()));
        };

        let scanner = &self.ingestor.scanner;
        let layouts: Vec<MessageLayout> = scanner
            .scan(&*file, task.size, &[task.loc])?
            .collect::<Result<_>>()?;

        let mut scanned = Vec::with_capacity(layouts.len());
        for layout in layouts {
            read_at(file, layout.loc, &mut self.buf)?;
            let date_bytes = self
                .buf
                .get(layout.date_loc.as_range())
                .ok_or_else(|| LogheapError::date_parse(&[], self.ingestor.date_format.as_str()))?;
            let date = self.ingestor.date_format.parse(date_bytes)?;
            let terms = self
                .ingestor
                .tokenizer
                .index_terms(&layout.date_loc.excise(&self.buf));
            scanned.push(ScannedMessage {
                layout,
                date,
                terms,
            });
        }
        Ok(scanned)
    }
}
