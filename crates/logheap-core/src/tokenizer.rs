//! Term extraction for the posting store.
//!
//! Terms are lower-cased tokens split on whitespace and punctuation. Tokens
//! shorter than the minimum length are dropped and longer ones are cut to the
//! maximum length, so a long identifier still indexes its leading part.

use crate::error::{LogheapError, Result};
use std::collections::HashSet;

const SEPARATORS: &str = " \r\n\t!()-[]{};:`'\"\\,<>./?@#$%^&*_~";

fn is_separator(c: char) -> bool {
    c.is_whitespace() || SEPARATORS.contains(c)
}

/// Splits message bodies and query literals into terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tokenizer {
    min_len: usize,
    max_len: usize,
}

impl Tokenizer {
    /// Create a tokenizer. Lengths are counted in characters.
    pub fn new(min_len: usize, max_len: usize) -> Result<Self> {
        if min_len == 0 || min_len > max_len {
            return Err(LogheapError::ConfigError {
                reason: format!("invalid term length bounds: min {min_len}, max {max_len}"),
            });
        }
        Ok(Tokenizer { min_len, max_len })
    }

    pub fn min_len(&self) -> usize {
        self.min_len
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Lower-cased tokens of `text` before any length filtering.
    fn raw_tokens(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(is_separator)
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
    }

    fn truncate(&self, token: &str) -> String {
        match token.char_indices().nth(self.max_len) {
            Some((cut, _)) => token[..cut].to_string(),
            None => token.to_string(),
        }
    }

    /// Deduplicated, length-bounded terms of `bytes`.
    pub fn tokenize(&self, bytes: &[u8]) -> HashSet<String> {
        let text = String::from_utf8_lossy(bytes);
        Self::raw_tokens(&text)
            .filter(|t| t.chars().count() >= self.min_len)
            .map(|t| self.truncate(&t))
            .collect()
    }

    /// Terms written to the posting store for a message body.
    ///
    /// Every suffix of a token that is at least `min_len` long is emitted
    /// (each cut to `max_len`), so a prefix lookup of a query term also finds
    /// segments where the term occurs inside a longer word.
    pub fn index_terms(&self, bytes: &[u8]) -> HashSet<String> {
        let text = String::from_utf8_lossy(bytes);
        let mut terms = HashSet::new();
        for token in Self::raw_tokens(&text) {
            let starts: Vec<usize> = token.char_indices().map(|(i, _)| i).collect();
            let chars = starts.len();
            if chars < self.min_len {
                continue;
            }
            for &start in &starts[..=chars - self.min_len] {
                terms.insert(self.truncate(&token[start..]));
            }
        }
        terms
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Tokenizer {
            min_len: 4,
            max_len: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(set: HashSet<String>) -> Vec<String> {
        let mut v: Vec<String> = set.into_iter().collect();
        v.sort();
        v
    }

    #[test]
    fn test_tokenize() {
        let tok = Tokenizer::new(3, 6).unwrap();
        let terms = tok.tokenize(b"ERROR: user_id=42 failed [Connection-Reset] at db.local");
        assert_eq!(
            sorted(terms),
            vec!["connec", "error", "failed", "id=42", "local", "reset", "user"]
        );
    }

    #[test]
    fn test_tokenize_dedup_and_case() {
        let tok = Tokenizer::new(2, 10).unwrap();
        let terms = tok.tokenize(b"Foo foo FOO bar");
        assert_eq!(sorted(terms), vec!["bar", "foo"]);
    }

    #[test]
    fn test_tokenize_counts_chars_not_bytes() {
        let tok = Tokenizer::new(2, 3).unwrap();
        let terms = tok.tokenize("été ÉTÉS ü".as_bytes());
        assert_eq!(sorted(terms), vec!["été"]);
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(Tokenizer::new(0, 4).is_err());
        assert!(Tokenizer::new(5, 4).is_err());
        assert!(Tokenizer::new(4, 4).is_ok());
    }

    #[test]
    fn test_index_terms_cover_inner_matches() {
        let tok = Tokenizer::new(3, 5).unwrap();
        let terms = tok.index_terms(b"xconnect");
        assert_eq!(
            sorted(terms),
            vec!["conne", "ect", "nect", "nnect", "onnec", "xconn"]
        );

        // A query term found inside the word resolves by prefix
        let query = tok.tokenize(b"onnect");
        let q = query.iter().next().unwrap();
        assert!(tok.index_terms(b"xconnect").iter().any(|t| t.starts_with(q.as_str())));
    }
}
