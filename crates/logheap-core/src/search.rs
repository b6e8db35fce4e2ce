//! Streaming query matching over committed segments.
//!
//! The segments to read are ordered by `(date_min, id)` and handed to a pool
//! of workers. Each worker reads its segment's bytes through a cached file
//! descriptor, re-parses every date, applies the date bounds and runs the compiled
//! expression over the body with the date cut out.
//!
//! Results leave in segment order. Finished segments park in a window of
//! `2 × concurrency` slots; a worker whose segment is too far ahead of the
//! reader waits until the window moves. That bounds memory no matter how
//! uneven segment costs are.

use crate::catalog::Catalog;
use crate::date::DateFormat;
use crate::error::{LogheapError, Result};
use crate::eval::Candidates;
use crate::expr::CompiledExpr;
use crate::location::Location;
use crate::types::{FileId, FoundMessage, QueryId, Segment};
use crate::writer::Appender;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag shared between a search and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Receives matches in order.
pub trait ResultSink: Send {
    fn push(&mut self, found: FoundMessage) -> Result<()>;

    /// Called once, `completed` is false after cancellation or an error.
    fn finish(&mut self, completed: bool) -> Result<()>;
}

/// Collects matches in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub found: Vec<FoundMessage>,
    pub completed: Option<bool>,
}

impl ResultSink for VecSink {
    fn push(&mut self, found: FoundMessage) -> Result<()> {
        self.found.push(found);
        Ok(())
    }

    fn finish(&mut self, completed: bool) -> Result<()> {
        self.completed = Some(completed);
        Ok(())
    }
}

/// Forwards matches to a channel. A dropped receiver is not an error; the
/// search keeps going for the other sinks.
pub struct ChannelSink {
    tx: Option<Sender<FoundMessage>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<FoundMessage>) -> Self {
        ChannelSink { tx: Some(tx) }
    }
}

impl ResultSink for ChannelSink {
    fn push(&mut self, found: FoundMessage) -> Result<()> {
        if let Some(tx) = &self.tx {
            if tx.send(found).is_err() {
                self.tx = None;
            }
        }
        Ok(())
    }

    fn finish(&mut self, _completed: bool) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Streams matches into a query record through a result writer.
pub struct QueryRecorder {
    catalog: Arc<dyn Catalog>,
    id: QueryId,
    writer: Option<Appender<FoundMessage>>,
}

impl QueryRecorder {
    pub fn new(catalog: Arc<dyn Catalog>, id: QueryId, flush_every: Duration) -> Result<Self> {
        let sink_catalog = catalog.clone();
        let writer = Appender::spawn(format!("results-{id}"), 1024, flush_every, move |rows| {
            replaced_is_ok(sink_catalog.append_results(id, rows))
        })?;
        Ok(QueryRecorder {
            catalog,
            id,
            writer: Some(writer),
        })
    }
}

impl ResultSink for QueryRecorder {
    fn push(&mut self, found: FoundMessage) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.append(found),
            None => Err(LogheapError::WriterClosed {
                name: format!("results-{}", self.id),
            }),
        }
    }

    fn finish(&mut self, completed: bool) -> Result<()> {
        let closed = match self.writer.take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        };
        replaced_is_ok(self.catalog.finish_query(self.id, completed && closed.is_ok()))?;
        closed
    }
}

/// A newer run of the same query deletes this record; the search goes on
/// without recording.
fn replaced_is_ok(result: Result<()>) -> Result<()> {
    match result {
        Err(LogheapError::QueryNotFound { .. }) => Ok(()),
        other => other,
    }
}

impl<A: ResultSink, B: ResultSink> ResultSink for (A, B) {
    fn push(&mut self, found: FoundMessage) -> Result<()> {
        self.0.push(found.clone())?;
        self.1.push(found)
    }

    fn finish(&mut self, completed: bool) -> Result<()> {
        let first = self.0.finish(completed);
        let second = self.1.finish(completed);
        first.and(second)
    }
}

/// What a search needs from the engine.
pub struct SearchContext<'a> {
    pub catalog: &'a dyn Catalog,
    pub date_format: &'a DateFormat,
    pub concurrency: usize,
    /// Bytes read through one descriptor before the file is reopened
    pub reopen_after_bytes: u64,
}

/// Summary of one search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOutcome {
    pub segments: usize,
    pub messages: usize,
    pub matched: usize,
    /// False when the search was cancelled
    pub completed: bool,
}

enum Slot {
    Done { found: Vec<FoundMessage>, messages: usize },
    Failed(LogheapError),
}

struct WindowState {
    cursor: usize,
    ready: BTreeMap<usize, Slot>,
    aborted: bool,
}

/// Ordered hand-off between workers and the reader.
struct Window {
    size: usize,
    state: Mutex<WindowState>,
    moved: Condvar,
}

impl Window {
    fn new(size: usize) -> Self {
        Window {
            size: size.max(1),
            state: Mutex::new(WindowState {
                cursor: 0,
                ready: BTreeMap::new(),
                aborted: false,
            }),
            moved: Condvar::new(),
        }
    }

    /// Block until `index` fits the window. False once the search aborted.
    fn admit(&self, index: usize) -> bool {
        let mut state = self.state.lock();
        while !state.aborted && index >= state.cursor + self.size {
            self.moved.wait(&mut state);
        }
        !state.aborted
    }

    fn put(&self, index: usize, slot: Slot) {
        let mut state = self.state.lock();
        state.ready.insert(index, slot);
        self.moved.notify_all();
    }

    /// Wait for the slot at the cursor and advance. None once aborted or
    /// cancelled, since a cancelled feeder may never hand out that index.
    fn take(&self, cancel: &CancelToken) -> Option<Slot> {
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return None;
            }
            let cursor = state.cursor;
            if let Some(slot) = state.ready.remove(&cursor) {
                state.cursor += 1;
                self.moved.notify_all();
                return Some(slot);
            }
            if cancel.is_cancelled() {
                return None;
            }
            self.moved.wait_for(&mut state, CANCEL_POLL);
        }
    }

    fn abort(&self) {
        self.state.lock().aborted = true;
        self.moved.notify_all();
    }
}

/// Run `expr` over the candidate segments, streaming matches into `sink`.
///
/// On success the sink is finished as completed unless `cancel` fired. A
/// worker error stops the stream, finishes the sink as not completed and is
/// returned.
#[instrument(skip_all, fields(concurrency = ctx.concurrency))]
pub fn search(
    ctx: &SearchContext<'_>,
    expr: &CompiledExpr,
    candidates: &Candidates,
    date_min: Option<DateTime<Utc>>,
    date_max: Option<DateTime<Utc>>,
    cancel: &CancelToken,
    sink: &mut dyn ResultSink,
) -> Result<SearchOutcome> {
    let started = Instant::now();
    let streamed = stream(ctx, expr, candidates, date_min, date_max, cancel, sink);

    match streamed {
        Ok(mut outcome) => {
            outcome.completed = !cancel.is_cancelled();
            sink.finish(outcome.completed)?;
            info!(
                segments = outcome.segments,
                messages = outcome.messages,
                matched = outcome.matched,
                completed = outcome.completed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "search finished"
            );
            Ok(outcome)
        }
        Err(e) => {
            if let Err(finish) = sink.finish(false) {
                warn!(error = %finish, "could not finish result sink");
            }
            Err(e)
        }
    }
}

fn stream(
    ctx: &SearchContext<'_>,
    expr: &CompiledExpr,
    candidates: &Candidates,
    date_min: Option<DateTime<Utc>>,
    date_max: Option<DateTime<Utc>>,
    cancel: &CancelToken,
    sink: &mut dyn ResultSink,
) -> Result<SearchOutcome> {
    let universe: Vec<Segment> = ctx
        .catalog
        .all_segments()?
        .into_iter()
        .filter(|s| candidates.contains(s.id) && s.overlaps_dates(date_min, date_max))
        .collect();
    let paths: HashMap<FileId, PathBuf> = ctx
        .catalog
        .list_files()?
        .into_iter()
        .map(|f| (f.id, f.path))
        .collect();

    let mut outcome = SearchOutcome {
        segments: universe.len(),
        ..SearchOutcome::default()
    };
    debug!(segments = universe.len(), full = candidates.is_all(), "search universe");
    if universe.is_empty() {
        return Ok(outcome);
    }

    let workers = ctx.concurrency.max(1).min(universe.len());
    let window = Window::new(workers * 2);
    let (index_tx, index_rx) = bounded::<usize>(workers * 2);
    let scan = SegmentScan {
        ctx,
        expr,
        date_min,
        date_max,
        paths: &paths,
    };
    let (universe, window, scan) = (&universe, &window, &scan);

    thread::scope(|scope| {
        let streamed = (|| {
            let count = universe.len();
            thread::Builder::new()
                .name("logheap-search-feeder".to_string())
                .spawn_scoped(scope, move || feed(count, index_tx, cancel))?;

            for i in 0..workers {
                let rx = index_rx.clone();
                thread::Builder::new()
                    .name(format!("logheap-search-{i}"))
                    .spawn_scoped(scope, move || {
                        let mut files = FileReaders::new(scan.ctx.reopen_after_bytes);
                        work(universe, rx, window, scan, &mut files, cancel);
                    })?;
            }
            drop(index_rx);

            read_window(count, window, cancel, sink, &mut outcome)
        })();
        // Releases workers parked on the window so the scope can join them.
        window.abort();
        streamed
    })?;

    Ok(outcome)
}

fn feed(count: usize, tx: Sender<usize>, cancel: &CancelToken) {
    for index in 0..count {
        if cancel.is_cancelled() || tx.send(index).is_err() {
            break;
        }
    }
}

fn work(
    universe: &[Segment],
    rx: Receiver<usize>,
    window: &Window,
    scan: &SegmentScan<'_>,
    files: &mut FileReaders,
    cancel: &CancelToken,
) {
    for index in rx {
        if !window.admit(index) {
            break;
        }
        let slot = if cancel.is_cancelled() {
            Slot::Done {
                found: Vec::new(),
                messages: 0,
            }
        } else {
            match scan.run(&universe[index], files) {
                Ok((found, messages)) => Slot::Done { found, messages },
                Err(e) => Slot::Failed(e),
            }
        };
        window.put(index, slot);
    }
}

fn read_window(
    count: usize,
    window: &Window,
    cancel: &CancelToken,
    sink: &mut dyn ResultSink,
    outcome: &mut SearchOutcome,
) -> Result<()> {
    for _ in 0..count {
        if cancel.is_cancelled() {
            debug!("search cancelled");
            return Ok(());
        }
        match window.take(cancel) {
            Some(Slot::Done { found, messages }) => {
                outcome.messages += messages;
                outcome.matched += found.len();
                for message in found {
                    sink.push(message)?;
                }
            }
            Some(Slot::Failed(e)) => return Err(e),
            None => break,
        }
    }
    Ok(())
}

/// Per-search state every worker shares.
struct SegmentScan<'a> {
    ctx: &'a SearchContext<'a>,
    expr: &'a CompiledExpr,
    date_min: Option<DateTime<Utc>>,
    date_max: Option<DateTime<Utc>>,
    paths: &'a HashMap<FileId, PathBuf>,
}

impl SegmentScan<'_> {
    /// Matches of one segment and the number of messages looked at.
    fn run(&self, segment: &Segment, files: &mut FileReaders) -> Result<(Vec<FoundMessage>, usize)> {
        let messages = self.ctx.catalog.messages(&[segment.id], None, None)?;
        if messages.is_empty() {
            return Ok((Vec::new(), 0));
        }
        let path = self
            .paths
            .get(&segment.file)
            .ok_or_else(|| LogheapError::Internal(format!("segment {} has no file", segment.id)))?;
        let data = files.read(segment.file, path, segment.loc)?;
        let base = segment.loc.from;

        let mut found = Vec::new();
        for message in &messages {
            let range = (message.loc.from - base) as usize..(message.loc.to - base) as usize;
            let Some(body) = data.get(range) else {
                debug!(file = %path.display(), loc = %message.loc, "message lies past the file end");
                continue;
            };
            let Some(date_bytes) = body.get(message.date_loc.as_range()) else {
                continue;
            };
            let date = match self.ctx.date_format.parse(date_bytes) {
                Ok(date) => date,
                Err(e) => {
                    debug!(file = %path.display(), loc = %message.loc, error = %e, "skipping message");
                    continue;
                }
            };
            if self.date_min.map_or(false, |min| date < min)
                || self.date_max.map_or(false, |max| date > max)
            {
                continue;
            }
            if self.expr.matches(&message.date_loc.excise(body)) {
                found.push(FoundMessage {
                    file: segment.file,
                    loc: message.loc,
                    date,
                });
            }
        }
        Ok((found, messages.len()))
    }
}

struct OpenFile {
    file: File,
    read: u64,
}

/// Descriptors one worker holds, reopened once enough has been read through
/// them so a rotated file is picked up by path again.
struct FileReaders {
    reopen_after: u64,
    open: HashMap<FileId, OpenFile>,
    buf: Vec<u8>,
}

impl FileReaders {
    fn new(reopen_after: u64) -> Self {
        FileReaders {
            reopen_after: reopen_after.max(1),
            open: HashMap::new(),
            buf: Vec::new(),
        }
    }

    /// The bytes of `loc` still present in the file. A file truncated after
    /// the segment was committed yields a shorter slice.
    fn read(&mut self, file: FileId, path: &Path, loc: Location) -> Result<&[u8]> {
        let reopen = self
            .open
            .get(&file)
            .map_or(true, |open| open.read >= self.reopen_after);
        if reopen {
            let handle = File::open(path)?;
            self.open.insert(file, OpenFile { file: handle, read: 0 });
        }
        let open = self
            .open
            .get_mut(&file)
            .ok_or_else(|| LogheapError::Internal("file descriptor vanished".to_string()))?;

        self.buf.clear();
        open.file.seek(SeekFrom::Start(loc.from))?;
        (&mut open.file).take(loc.len()).read_to_end(&mut self.buf)?;
        open.read += self.buf.len() as u64;
        Ok(self.buf.as_slice())
    }
}
