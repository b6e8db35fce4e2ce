//! Index-assisted narrowing of the segment universe.
//!
//! The posting store knows which segments contain a term, never which are
//! free of one, so the result is always a superset of the segments that can
//! match. The byte-level matcher removes the false positives.

use crate::expr::Expr;
use crate::postings::PostingStore;
use crate::tokenizer::Tokenizer;
use crate::types::SegmentId;
use crate::error::Result;
use std::collections::BTreeSet;

/// Segments that may contain a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    /// Every segment; the index cannot narrow this expression.
    All,
    Set(BTreeSet<SegmentId>),
}

impl Candidates {
    pub fn contains(&self, id: SegmentId) -> bool {
        match self {
            Candidates::All => true,
            Candidates::Set(set) => set.contains(&id),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Candidates::All)
    }

    fn intersect(self, other: Candidates) -> Candidates {
        match (self, other) {
            (Candidates::All, c) | (c, Candidates::All) => c,
            (Candidates::Set(a), Candidates::Set(b)) => {
                Candidates::Set(a.intersection(&b).copied().collect())
            }
        }
    }

    fn union(self, other: Candidates) -> Candidates {
        match (self, other) {
            (Candidates::All, _) | (_, Candidates::All) => Candidates::All,
            (Candidates::Set(mut a), Candidates::Set(b)) => {
                a.extend(b);
                Candidates::Set(a)
            }
        }
    }
}

/// True when the index cannot narrow `expr` and every segment must be read.
///
/// Regex leaves and literals without indexable terms force a full scan. An
/// OR needs any full-scan child to be one itself, an AND needs all of them,
/// and NOT always is.
pub fn should_full_scan(expr: &Expr, tokenizer: &Tokenizer) -> bool {
    match expr {
        Expr::Literal(text) => tokenizer.tokenize(text.as_bytes()).is_empty(),
        Expr::Regex { .. } => true,
        Expr::Not(_) => true,
        Expr::Or(ops) => ops.iter().any(|op| should_full_scan(op, tokenizer)),
        Expr::And(ops) => ops.iter().all(|op| should_full_scan(op, tokenizer)),
    }
}

/// Resolve `expr` against the posting store.
pub fn eval(expr: &Expr, postings: &dyn PostingStore, tokenizer: &Tokenizer) -> Result<Candidates> {
    Ok(match expr {
        Expr::Literal(text) => {
            let terms: Vec<String> = tokenizer.tokenize(text.as_bytes()).into_iter().collect();
            if terms.is_empty() {
                return Ok(Candidates::All);
            }
            let found = postings.prefix_search(&terms)?;
            let mut result = Candidates::All;
            for term in &terms {
                let ids = found.get(term).cloned().unwrap_or_default();
                result = result.intersect(Candidates::Set(ids));
            }
            result
        }
        Expr::Regex { .. } | Expr::Not(_) => Candidates::All,
        Expr::And(ops) => {
            let mut result = Candidates::All;
            for op in ops {
                result = result.intersect(eval(op, postings, tokenizer)?);
                if matches!(&result, Candidates::Set(s) if s.is_empty()) {
                    break;
                }
            }
            result
        }
        Expr::Or(ops) => {
            let mut result = Candidates::Set(BTreeSet::new());
            for op in ops {
                result = result.union(eval(op, postings, tokenizer)?);
                if result.is_all() {
                    break;
                }
            }
            result
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::postings::MemoryPostings;

    fn ids(v: &[u64]) -> Candidates {
        Candidates::Set(v.iter().map(|&i| SegmentId::new(i)).collect())
    }

    fn store() -> (MemoryPostings, Tokenizer) {
        let tok = Tokenizer::new(3, 8).unwrap();
        let postings = MemoryPostings::new();
        postings
            .put(&tok.index_terms(b"database timeout error"), SegmentId::new(1))
            .unwrap();
        postings
            .put(&tok.index_terms(b"database connected"), SegmentId::new(2))
            .unwrap();
        postings
            .put(&tok.index_terms(b"user login error"), SegmentId::new(3))
            .unwrap();
        (postings, tok)
    }

    #[test]
    fn test_should_full_scan() {
        let tok = Tokenizer::new(4, 8).unwrap();
        let fs = |q: &str| should_full_scan(&parse(q).unwrap(), &tok);

        assert!(!fs("error"));
        assert!(fs("err"));
        assert!(fs("~err"));
        assert!(fs("!error"));
        assert!(!fs("error !timeout"));
        assert!(fs("error OR !timeout"));
        assert!(fs("error OR ~x"));
        assert!(!fs("error ~x"));
        assert!(fs(""));
    }

    #[test]
    fn test_eval_sets() {
        let (postings, tok) = store();
        let ev = |q: &str| eval(&parse(q).unwrap(), &postings, &tok).unwrap();

        assert_eq!(ev("error"), ids(&[1, 3]));
        assert_eq!(ev("database error"), ids(&[1]));
        assert_eq!(ev("timeout OR login"), ids(&[1, 3]));
        assert_eq!(ev("\"database timeout\""), ids(&[1]));
        assert_eq!(ev("missing"), ids(&[]));
    }

    #[test]
    fn test_eval_all_markers() {
        let (postings, tok) = store();
        let ev = |q: &str| eval(&parse(q).unwrap(), &postings, &tok).unwrap();

        assert_eq!(ev("~data"), Candidates::All);
        assert_eq!(ev("!error"), Candidates::All);
        assert_eq!(ev("error !login"), ids(&[1, 3]));
        assert_eq!(ev("error OR ~x"), Candidates::All);
        assert_eq!(ev("db"), Candidates::All);
    }

    #[test]
    fn test_eval_inner_word() {
        let (postings, tok) = store();
        // "nected" sits inside "connected"
        let c = eval(&parse("nected").unwrap(), &postings, &tok).unwrap();
        assert_eq!(c, ids(&[2]));
    }
}
