//! # Logheap Core Library
//!
//! This crate provides log ingestion, term indexing and streaming search for
//! the Logheap log indexer. Log files are cut into size-bounded segments of
//! whole messages; each segment carries its date bounds and the terms of its
//! messages, so a query only reads the segments that can match.
//!
//! ## Architecture
//!
//! - **Scanning** (`scanner`, `date`): Find message boundaries and parse dates
//! - **Terms** (`tokenizer`): Extract the terms indexed per segment
//! - **Stores** (`catalog`, `postings`, `writer`): Files, segments, messages,
//!   queries and the term index, with single-writer append actors
//! - **Ingestion** (`ingest`, `segment`): Discover files and commit segments
//! - **Queries** (`parser`, `expr`, `eval`, `search`): Parse, narrow through
//!   the index and match message bodies
//! - **Persistence** (`persistence`): Snapshots of the stores on disk
//! - **Config** (`config`): Configuration management
//! - **Engine** (`engine`): Everything above behind one handle
//!
//! ## Example
//!
//! ```rust,ignore
//! use logheap_core::{Config, Engine};
//!
//! let engine = Engine::open(Config::load()?)?;
//! engine.ingest()?;
//!
//! let handle = engine.query("timeout AND !retry", None, None)?;
//! for found in handle.results() {
//!     println!("{}", engine.message_text(&found)?);
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod date;
pub mod engine;
pub mod error;
pub mod eval;
pub mod expr;
pub mod ingest;
pub mod location;
pub mod parser;
pub mod persistence;
pub mod postings;
pub mod scanner;
pub mod search;
pub mod segment;
pub mod tokenizer;
pub mod types;
pub mod writer;

// Re-export commonly used types
pub use catalog::{Catalog, MemoryCatalog};
pub use config::Config;
pub use engine::{Engine, EngineStatus, MaintenanceReport, QueryHandle};
pub use error::{LogheapError, Result};
pub use expr::{CompiledExpr, Expr};
pub use ingest::{IngestReport, Ingestor};
pub use location::Location;
pub use parser::parse;
pub use postings::{MemoryPostings, PostingStore};
pub use search::{CancelToken, ResultSink, SearchOutcome};
pub use types::{FileId, FoundMessage, QueryId, QueryRecord, Segment, SegmentId, StoreStats};
