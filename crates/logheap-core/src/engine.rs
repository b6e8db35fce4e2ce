//! The engine: stores, ingestion, maintenance and queries behind one handle.
//!
//! Ingestion and maintenance mutate segment layout and take the write lock,
//! so they never overlap. Queries only read and run next to either.

use crate::catalog::{Catalog, CatalogSnapshot, MemoryCatalog};
use crate::config::Config;
use crate::date::DateFormat;
use crate::error::{LogheapError, Result};
use crate::eval::{eval, should_full_scan, Candidates};
use crate::expr::CompiledExpr;
use crate::ingest::{IngestReport, Ingestor};
use crate::parser::parse;
use crate::persistence::SnapshotStore;
use crate::postings::{MemoryPostings, PostingStore, PostingsSnapshot};
use crate::search::{search, CancelToken, ChannelSink, QueryRecorder, SearchContext, SearchOutcome};
use crate::segment::{gc_orphans, merge_small_segments, GcReport};
use crate::tokenizer::Tokenizer;
use crate::types::{FoundMessage, QueryId, QueryRecord, StoreStats};
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const CATALOG_SNAPSHOT: &str = "catalog";
const POSTINGS_SNAPSHOT: &str = "postings";

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub tails_corrected: usize,
    pub segments_merged: usize,
    pub gc: GcReport,
    pub queries_evicted: usize,
}

/// Store counters and where they live.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub storage_dir: PathBuf,
    pub stats: StoreStats,
}

/// A running query.
pub struct QueryHandle {
    id: QueryId,
    cancel: CancelToken,
    results: Receiver<FoundMessage>,
    handle: JoinHandle<Result<SearchOutcome>>,
}

impl QueryHandle {
    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Matches as they are found, in segment order.
    pub fn results(&self) -> &Receiver<FoundMessage> {
        &self.results
    }

    /// Wait for the search to end.
    pub fn wait(self) -> Result<SearchOutcome> {
        self.handle
            .join()
            .map_err(|_| LogheapError::Internal(format!("query {} panicked", self.id)))?
    }
}

/// Log index engine backed by in-memory stores and snapshots.
pub struct Engine {
    config: Config,
    catalog: Arc<MemoryCatalog>,
    postings: Arc<MemoryPostings>,
    store: SnapshotStore,
    ingestor: Ingestor,
    tokenizer: Tokenizer,
    date_format: DateFormat,
    /// Held by ingestion, maintenance and snapshot writes
    writing: Arc<Mutex<()>>,
}

impl Engine {
    /// Open the engine, loading snapshots from the configured storage
    /// directory. Unreadable snapshots are logged and replaced by empty stores.
    /// An `"auto"` date format is resolved from the log files first.
    pub fn open(mut config: Config) -> Result<Self> {
        config.detect_date_format()?;
        config.validate()?;
        let storage_dir = config.storage_dir()?;
        let store = SnapshotStore::new(&storage_dir);

        let catalog = Arc::new(MemoryCatalog::from_snapshot(
            store.load_or_default::<CatalogSnapshot>(CATALOG_SNAPSHOT),
        ));
        let postings = Arc::new(MemoryPostings::from_snapshot(
            store.load_or_default::<PostingsSnapshot>(POSTINGS_SNAPSHOT),
        ));
        let ingestor = Ingestor::new(catalog.clone(), postings.clone(), &config)?;

        info!(storage = %storage_dir.display(), "engine opened");
        Ok(Engine {
            tokenizer: config.tokenizer()?,
            date_format: config.date_format(),
            config,
            catalog,
            postings,
            store,
            ingestor,
            writing: Arc::new(Mutex::new(())),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    /// Run one ingestion pass and snapshot the result.
    pub fn ingest(&self) -> Result<IngestReport> {
        let _guard = self.writing.lock();
        let report = self.ingestor.run()?;
        self.save_locked()?;
        Ok(report)
    }

    /// Tail correction, segment merging, orphan GC and query eviction,
    /// followed by a snapshot.
    #[instrument(skip(self))]
    pub fn maintain(&self) -> Result<MaintenanceReport> {
        let _guard = self.writing.lock();
        let started = Instant::now();

        let tails_corrected = self.ingestor.correct_tails()?;
        let segments_merged = merge_small_segments(
            self.catalog.as_ref(),
            self.postings.as_ref(),
            self.ingestor.segment_size(),
        )?;
        let gc = gc_orphans(self.catalog.as_ref(), self.postings.as_ref())?;

        let ttl = chrono::Duration::seconds(self.config.search.query_ttl_secs as i64);
        let queries_evicted = self.catalog.evict_queries(Utc::now() - ttl)?;

        self.save_locked()?;
        let report = MaintenanceReport {
            tails_corrected,
            segments_merged,
            gc,
            queries_evicted,
        };
        debug!(?report, elapsed_ms = started.elapsed().as_millis() as u64, "maintenance finished");
        Ok(report)
    }

    /// Start a query. Syntax errors are returned here; the search itself runs
    /// on a background thread and streams into the handle and the query
    /// record. Earlier records of the same query and bounds are replaced.
    pub fn query(
        &self,
        text: &str,
        date_min: Option<DateTime<Utc>>,
        date_max: Option<DateTime<Utc>>,
    ) -> Result<QueryHandle> {
        let expr = parse(text)?;
        let compiled = CompiledExpr::compile(&expr)?;

        for old in self.catalog.find_queries(text, date_min, date_max)? {
            debug!(query = %old.id, "replacing earlier run of the same query");
            self.catalog.delete_query(old.id)?;
        }

        let candidates = if should_full_scan(&expr, &self.tokenizer) {
            Candidates::All
        } else {
            eval(&expr, self.postings.as_ref(), &self.tokenizer)?
        };
        debug!(query = %expr, full_scan = candidates.is_all(), "query planned");

        let record = self.catalog.create_query(text, date_min, date_max)?;
        let id = record.id;
        let catalog: Arc<dyn Catalog> = self.catalog.clone();
        let recorder = QueryRecorder::new(
            catalog.clone(),
            id,
            Duration::from_millis(self.config.search.result_flush_ms.max(1)),
        )?;
        let (tx, rx) = unbounded();
        let cancel = CancelToken::new();

        let date_format = self.date_format.clone();
        let concurrency = self.config.search_concurrency();
        let reopen_after_bytes = self.config.search.reopen_after_bytes;
        let token = cancel.clone();
        let snapshot = Snapshot {
            store: self.store.clone(),
            catalog: self.catalog.clone(),
            postings: self.postings.clone(),
            writing: self.writing.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("logheap-query-{id}"))
            .spawn(move || {
                let ctx = SearchContext {
                    catalog: catalog.as_ref(),
                    date_format: &date_format,
                    concurrency,
                    reopen_after_bytes,
                };
                let mut sink = (recorder, ChannelSink::new(tx));
                let outcome =
                    search(&ctx, &compiled, &candidates, date_min, date_max, &token, &mut sink)?;
                snapshot.save_if_idle();
                Ok(outcome)
            })?;

        Ok(QueryHandle {
            id,
            cancel,
            results: rx,
            handle,
        })
    }

    pub fn results(&self, id: QueryId, skip: usize, limit: usize) -> Result<Vec<FoundMessage>> {
        self.catalog.get_query(id)?;
        self.catalog.query_results(id, skip, limit)
    }

    pub fn queries(&self) -> Result<Vec<QueryRecord>> {
        self.catalog.list_queries()
    }

    pub fn delete_query(&self, id: QueryId) -> Result<()> {
        self.catalog.delete_query(id)
    }

    /// Read the bytes of a matched message from its file.
    pub fn message_text(&self, found: &FoundMessage) -> Result<String> {
        let record = self
            .catalog
            .file(found.file)?
            .ok_or_else(|| LogheapError::Internal(format!("file {} is not tracked", found.file)))?;
        let mut file = File::open(&record.path).map_err(|_| LogheapError::FileNotFound {
            path: record.path.clone(),
        })?;
        let mut buf = vec![0; found.loc.len() as usize];
        file.seek(SeekFrom::Start(found.loc.from))?;
        file.read_exact(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn status(&self) -> Result<EngineStatus> {
        let mut stats = self.catalog.stats()?;
        stats.terms = self.postings.term_count();
        Ok(EngineStatus {
            storage_dir: self.store.base_dir().to_path_buf(),
            stats,
        })
    }

    /// Write both snapshots.
    pub fn save(&self) -> Result<()> {
        let _guard = self.writing.lock();
        self.save_locked()
    }

    fn save_locked(&self) -> Result<()> {
        save_snapshots(&self.store, &self.catalog, &self.postings)
    }

    /// Drop everything indexed and delete the snapshots.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.writing.lock();
        self.catalog.clear();
        self.postings.clear();
        self.store.clear(CATALOG_SNAPSHOT)?;
        self.store.clear(POSTINGS_SNAPSHOT)?;
        info!("index cleared");
        Ok(())
    }
}

fn save_snapshots(store: &SnapshotStore, catalog: &MemoryCatalog, postings: &MemoryPostings) -> Result<()> {
    store.save(CATALOG_SNAPSHOT, &catalog.snapshot())?;
    store.save(POSTINGS_SNAPSHOT, &postings.snapshot())?;
    Ok(())
}

/// What a finished query needs to persist its record.
struct Snapshot {
    store: SnapshotStore,
    catalog: Arc<MemoryCatalog>,
    postings: Arc<MemoryPostings>,
    writing: Arc<Mutex<()>>,
}

impl Snapshot {
    /// Save unless ingestion or maintenance is running; they save on their
    /// own when done.
    fn save_if_idle(&self) {
        let Some(_guard) = self.writing.try_lock() else {
            debug!("store busy, query record saved with the next snapshot");
            return;
        };
        if let Err(e) = save_snapshots(&self.store, &self.catalog, &self.postings) {
            warn!(error = %e, "failed to save snapshot after query");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;
    use crate::search::VecSink;
    use std::fs;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    fn line(sec: u32, body: &str) -> String {
        format!("2024-03-01 12:00:{sec:02} {body:<24}\n")
    }

    fn config(dir: &Path, segment_size: u64) -> Config {
        let mut config = Config::default();
        config.general.storage_dir = Some(dir.join("store"));
        config.ingest.files = vec![format!("{}/*.log", dir.display())];
        config.ingest.date_format = "%Y-%m-%d %H:%M:%S".to_string();
        config.ingest.segment_size = segment_size;
        config.ingest.concurrency = 2;
        config.search.concurrency = 2;
        config
    }

    fn append(path: &Path, text: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn collect(engine: &Engine, query: &str) -> Vec<FoundMessage> {
        let handle = engine.query(query, None, None).unwrap();
        let found: Vec<FoundMessage> = handle.results().iter().collect();
        handle.wait().unwrap();
        found
    }

    /// Search with a given candidate set, bypassing planning.
    fn search_with(engine: &Engine, query: &str, candidates: &Candidates) -> Vec<FoundMessage> {
        let compiled = CompiledExpr::compile(&parse(query).unwrap()).unwrap();
        let ctx = SearchContext {
            catalog: engine.catalog.as_ref(),
            date_format: &engine.date_format,
            concurrency: 2,
            reopen_after_bytes: 1 << 20,
        };
        let mut sink = VecSink::default();
        search(&ctx, &compiled, candidates, None, None, &CancelToken::new(), &mut sink).unwrap();
        sink.found
    }

    #[test]
    fn test_literal_in_second_message() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, &(line(0, "boot") + &line(1, "database timeout") + &line(2, "shutdown")));

        let engine = Engine::open(config(dir.path(), 80)).unwrap();
        engine.ingest().unwrap();

        let found = collect(&engine, "timeout");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].loc, Location::new(45, 90));
        assert!(engine.message_text(&found[0]).unwrap().contains("database timeout"));
    }

    #[test]
    fn test_index_does_not_change_results() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let bodies = [
            "disk full on sda1",
            "user login ok",
            "timeouts rising",
            "user logout",
            "disk check passed",
            "net timeout eth0",
        ];
        for (i, body) in bodies.iter().enumerate() {
            append(&path, &line(i as u32, body));
        }
        let engine = Engine::open(config(dir.path(), 60)).unwrap();
        engine.ingest().unwrap();

        for query in [
            "timeout",
            "disk user",
            "disk OR logout",
            "!user",
            "~time.*",
            "meou",
            "user (login OR logout)",
            "full !sda1",
        ] {
            let expr = parse(query).unwrap();
            let candidates = eval(&expr, engine.postings.as_ref(), &engine.tokenizer).unwrap();
            assert_eq!(
                search_with(&engine, query, &candidates),
                search_with(&engine, query, &Candidates::All),
                "query {query}"
            );
        }
    }

    #[test]
    fn test_repeated_query_sees_new_messages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, &line(0, "cache miss"));
        let engine = Engine::open(config(dir.path(), 1000)).unwrap();
        engine.ingest().unwrap();

        let first = engine.query("miss", None, None).unwrap();
        let first_id = first.id();
        assert_eq!(first.wait().unwrap().matched, 1);

        append(&path, &line(1, "another miss"));
        engine.ingest().unwrap();

        let again = engine.query("miss", None, None).unwrap();
        let id = again.id();
        assert_ne!(id, first_id);
        assert_eq!(again.results().iter().count(), 2);
        assert_eq!(again.wait().unwrap().matched, 2);

        // The earlier record is replaced
        let queries = engine.queries().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].id, id);
        assert_eq!(engine.results(id, 0, 10).unwrap().len(), 2);
        assert!(matches!(
            engine.results(first_id, 0, 10),
            Err(LogheapError::QueryNotFound { .. })
        ));
    }

    #[test]
    fn test_query_during_ingest_sees_whole_messages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let text: String = (0..40).map(|i| line(i % 60, "steady event")).collect();
        append(&path, &text);

        // Segments close near 400 bytes, so the last one stays open and is
        // resumed by every later run.
        let engine = Engine::open(config(dir.path(), 400)).unwrap();
        engine.ingest().unwrap();

        thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..25 {
                    append(&path, &line(i % 60, "growing event"));
                    engine.ingest().unwrap();
                }
            });

            for _ in 0..25 {
                let handle = engine.query("event", None, None).unwrap();
                let found: Vec<FoundMessage> = handle.results().iter().collect();
                assert!(handle.wait().unwrap().completed);
                assert!(found.len() >= 40);
                for message in &found {
                    assert_eq!(message.loc.len(), 45, "partial message at {}", message.loc);
                    assert_eq!(message.loc.from % 45, 0);
                }
                let mut starts: Vec<u64> = found.iter().map(|m| m.loc.from).collect();
                starts.sort_unstable();
                starts.dedup();
                assert_eq!(starts.len(), found.len());
            }
        });

        assert_eq!(collect(&engine, "growing").len(), 25);
    }

    #[test]
    fn test_replaced_query_still_completes() {
        let dir = TempDir::new().unwrap();
        append(&dir.path().join("app.log"), &line(0, "cache miss"));
        let engine = Engine::open(config(dir.path(), 1000)).unwrap();
        engine.ingest().unwrap();

        let first = engine.query("miss", None, None).unwrap();
        let second = engine.query("miss", None, None).unwrap();
        assert_eq!(second.wait().unwrap().matched, 1);
        assert!(first.wait().is_ok());
        assert_eq!(engine.queries().unwrap().len(), 1);
    }

    #[test]
    fn test_syntax_error_is_synchronous() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(dir.path(), 1000)).unwrap();
        assert!(matches!(
            engine.query("(broken", None, None),
            Err(LogheapError::QuerySyntax { .. })
        ));
        assert!(engine.queries().unwrap().is_empty());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        append(&dir.path().join("app.log"), &(line(0, "persisted row") + &line(1, "another")));

        {
            let engine = Engine::open(config(dir.path(), 1000)).unwrap();
            engine.ingest().unwrap();
        }

        let engine = Engine::open(config(dir.path(), 1000)).unwrap();
        let status = engine.status().unwrap();
        assert_eq!(status.stats.segments, 1);
        assert_eq!(status.stats.messages, 2);
        assert!(status.stats.terms > 0);
        assert_eq!(engine.ingest().unwrap().segments, 0);
        assert_eq!(collect(&engine, "persisted").len(), 1);
    }

    #[test]
    fn test_maintain_merges_small_segments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, &line(0, "one"));

        let engine = Engine::open(config(dir.path(), 40)).unwrap();
        engine.ingest().unwrap();
        append(&path, &line(1, "two"));
        engine.ingest().unwrap();
        append(&path, &line(2, "three"));
        engine.ingest().unwrap();
        assert_eq!(engine.status().unwrap().stats.segments, 3);

        // Each segment is 45 bytes; raise the size so merging applies.
        drop(engine);
        let engine = Engine::open(config(dir.path(), 60)).unwrap();
        let report = engine.maintain().unwrap();
        assert_eq!(report.segments_merged, 1);
        assert_eq!(engine.status().unwrap().stats.segments, 2);
        assert_eq!(collect(&engine, "").len(), 3);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        append(&dir.path().join("app.log"), &line(0, "gone soon"));
        let engine = Engine::open(config(dir.path(), 1000)).unwrap();
        engine.ingest().unwrap();

        engine.clear().unwrap();
        assert_eq!(engine.status().unwrap().stats.segments, 0);
        assert!(!dir.path().join("store").join("catalog.lhs").exists());
    }
}
