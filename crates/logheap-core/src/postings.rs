//! Term to segment postings.
//!
//! Terms map to segment ids, not messages: the index answers "which segments
//! might contain this", and search re-reads those segments to find the
//! messages. Lookups are by prefix so that a query term cut at the maximum
//! term length, or found inside a longer word, still resolves.

use crate::error::Result;
use crate::types::SegmentId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// The inverted index contract consumed by ingestion and search.
///
/// `put` is the only write on the ingestion path; callers funnel it through
/// a single writer.
pub trait PostingStore: Send + Sync {
    /// Record that `segment` contains each of `terms`.
    fn put(&self, terms: &HashSet<String>, segment: SegmentId) -> Result<()>;

    /// For each term, the segments holding any indexed term it prefixes.
    fn prefix_search(&self, terms: &[String]) -> Result<HashMap<String, BTreeSet<SegmentId>>>;

    /// Move every posting of `from` to `into`.
    fn reassign(&self, from: SegmentId, into: SegmentId) -> Result<()>;

    /// Drop postings of segments rejected by `keep`. Returns how many
    /// distinct segment ids were dropped.
    fn retain_segments(&self, keep: &dyn Fn(SegmentId) -> bool) -> Result<usize>;

    /// Number of distinct terms.
    fn term_count(&self) -> usize;
}

/// Serialized form of [`MemoryPostings`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PostingsSnapshot {
    pub terms: BTreeMap<String, BTreeSet<SegmentId>>,
}

/// Ordered in-memory posting store, persisted as a snapshot.
#[derive(Debug, Default)]
pub struct MemoryPostings {
    terms: RwLock<BTreeMap<String, BTreeSet<SegmentId>>>,
}

impl MemoryPostings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: PostingsSnapshot) -> Self {
        MemoryPostings {
            terms: RwLock::new(snapshot.terms),
        }
    }

    pub fn snapshot(&self) -> PostingsSnapshot {
        PostingsSnapshot {
            terms: self.terms.read().clone(),
        }
    }

    pub fn clear(&self) {
        self.terms.write().clear();
    }
}

impl PostingStore for MemoryPostings {
    fn put(&self, terms: &HashSet<String>, segment: SegmentId) -> Result<()> {
        let mut map = self.terms.write();
        for term in terms {
            match map.get_mut(term) {
                Some(set) => {
                    set.insert(segment);
                }
                None => {
                    map.insert(term.clone(), BTreeSet::from([segment]));
                }
            }
        }
        Ok(())
    }

    fn prefix_search(&self, terms: &[String]) -> Result<HashMap<String, BTreeSet<SegmentId>>> {
        let map = self.terms.read();
        let mut out = HashMap::with_capacity(terms.len());
        for term in terms {
            let mut ids = BTreeSet::new();
            for (_, segments) in map
                .range::<str, _>((std::ops::Bound::Included(term.as_str()), std::ops::Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(term.as_str()))
            {
                ids.extend(segments.iter().copied());
            }
            out.insert(term.clone(), ids);
        }
        Ok(out)
    }

    fn reassign(&self, from: SegmentId, into: SegmentId) -> Result<()> {
        let mut map = self.terms.write();
        for segments in map.values_mut() {
            if segments.remove(&from) {
                segments.insert(into);
            }
        }
        Ok(())
    }

    fn retain_segments(&self, keep: &dyn Fn(SegmentId) -> bool) -> Result<usize> {
        let mut map = self.terms.write();
        let mut dropped = BTreeSet::new();
        map.retain(|_, segments| {
            segments.retain(|id| {
                let kept = keep(*id);
                if !kept {
                    dropped.insert(*id);
                }
                kept
            });
            !segments.is_empty()
        });
        if !dropped.is_empty() {
            debug!(segments = dropped.len(), "dropped postings");
        }
        Ok(dropped.len())
    }

    fn term_count(&self) -> usize {
        self.terms.read().len()
    }
}
