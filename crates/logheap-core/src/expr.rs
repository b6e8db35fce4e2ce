//! Boolean query expressions and their byte-level matcher.
//!
//! An [`Expr`] is produced once by the parser and never mutated afterwards.
//! Index evaluation derives new structures from it, and [`CompiledExpr`]
//! turns it into a matcher that checks a message body:
//!
//! - literal leaves match as case-insensitive substrings; all of them are
//!   searched in one pass with an Aho-Corasick automaton
//! - regex leaves match with the case sensitivity they were written with

use crate::error::{LogheapError, Result};
use aho_corasick::{AhoCorasick, MatchKind};
use regex::bytes::Regex;
use std::fmt;

/// A query expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// All operands must match. `And(vec![])` matches everything.
    And(Vec<Expr>),
    /// At least one operand must match.
    Or(Vec<Expr>),
    /// None of the operands may match.
    Not(Vec<Expr>),
    /// Case-insensitive substring.
    Literal(String),
    Regex { pattern: String, case_sensitive: bool },
}

impl Expr {
    pub fn literal(text: impl Into<String>) -> Self {
        Expr::Literal(text.into())
    }

    pub fn regex(pattern: impl Into<String>, case_sensitive: bool) -> Self {
        Expr::Regex {
            pattern: pattern.into(),
            case_sensitive,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Expr::Literal(_) | Expr::Regex { .. })
    }

    /// Flatten nested nodes with the same operator and drop redundant
    /// single-operand wrappers.
    ///
    /// `AND(a, AND(b, c))` becomes `AND(a, b, c)` and `AND(OR(a, b))` becomes
    /// `OR(a, b)`. NOT nodes are never merged, since `NOT(NOT(a))` is not
    /// `NOT(a)`. A single leaf under AND keeps its wrapper.
    pub fn optimize(self) -> Expr {
        fn flatten(ops: Vec<Expr>, is_same: fn(&Expr) -> bool) -> Vec<Expr> {
            let mut out = Vec::with_capacity(ops.len());
            for op in ops.into_iter().map(Expr::optimize) {
                if is_same(&op) {
                    if let Expr::And(inner) | Expr::Or(inner) = op {
                        out.extend(inner);
                    }
                } else {
                    out.push(op);
                }
            }
            out
        }

        let optimized = match self {
            Expr::And(ops) => Expr::And(flatten(ops, |e| matches!(e, Expr::And(_)))),
            Expr::Or(ops) => Expr::Or(flatten(ops, |e| matches!(e, Expr::Or(_)))),
            Expr::Not(ops) => Expr::Not(ops.into_iter().map(Expr::optimize).collect()),
            leaf => leaf,
        };

        match optimized {
            Expr::And(mut ops) | Expr::Or(mut ops) if ops.len() == 1 && !ops[0].is_leaf() => {
                ops.remove(0)
            }
            other => other,
        }
    }

    /// Literals a matching message contains, in depth-first order. Negated
    /// subtrees are left out.
    pub fn keywords(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_keywords(&mut out);
        out
    }

    fn collect_keywords<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::And(ops) | Expr::Or(ops) => {
                for op in ops {
                    op.collect_keywords(out);
                }
            }
            Expr::Literal(text) => out.push(text.as_str()),
            Expr::Not(_) | Expr::Regex { .. } => {}
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, ops) = match self {
            Expr::And(ops) => ("AND", ops),
            Expr::Or(ops) => ("OR", ops),
            Expr::Not(ops) => ("NOT", ops),
            Expr::Literal(text) => return write!(f, "{text:?}"),
            Expr::Regex {
                pattern,
                case_sensitive,
            } => {
                let prefix = if *case_sensitive { "~~" } else { "~" };
                return write!(f, "{prefix}{pattern:?}");
            }
        };
        write!(f, "{name}(")?;
        for (i, op) in ops.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{op}")?;
        }
        write!(f, ")")
    }
}

/// Matcher tree with leaves resolved to compiled forms.
#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Vec<Node>),
    /// Index into the literal automaton's patterns
    Literal(usize),
    Always,
    Regex(usize),
}

/// An expression compiled for matching message bodies.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    root: Node,
    literals: Option<AhoCorasick>,
    literal_count: usize,
    regexes: Vec<Regex>,
}

impl CompiledExpr {
    pub fn compile(expr: &Expr) -> Result<Self> {
        let mut patterns: Vec<String> = Vec::new();
        let mut regexes: Vec<Regex> = Vec::new();
        let root = Self::build(expr, &mut patterns, &mut regexes)?;

        let literals = if patterns.is_empty() {
            None
        } else {
            let ac = AhoCorasick::builder()
                .match_kind(MatchKind::Standard)
                .build(&patterns)
                .map_err(|e| LogheapError::InvalidPattern {
                    pattern: patterns.join("|"),
                    reason: e.to_string(),
                })?;
            Some(ac)
        };

        Ok(CompiledExpr {
            root,
            literals,
            literal_count: patterns.len(),
            regexes,
        })
    }

    fn build(expr: &Expr, patterns: &mut Vec<String>, regexes: &mut Vec<Regex>) -> Result<Node> {
        Ok(match expr {
            Expr::And(ops) => Node::And(Self::build_all(ops, patterns, regexes)?),
            Expr::Or(ops) => Node::Or(Self::build_all(ops, patterns, regexes)?),
            Expr::Not(ops) => Node::Not(Self::build_all(ops, patterns, regexes)?),
            Expr::Literal(text) if text.is_empty() => Node::Always,
            Expr::Literal(text) => {
                let lowered = text.to_lowercase();
                let idx = match patterns.iter().position(|p| *p == lowered) {
                    Some(idx) => idx,
                    None => {
                        patterns.push(lowered);
                        patterns.len() - 1
                    }
                };
                Node::Literal(idx)
            }
            Expr::Regex {
                pattern,
                case_sensitive,
            } => {
                regexes.push(compile_regex(pattern, *case_sensitive)?);
                Node::Regex(regexes.len() - 1)
            }
        })
    }

    fn build_all(
        ops: &[Expr],
        patterns: &mut Vec<String>,
        regexes: &mut Vec<Regex>,
    ) -> Result<Vec<Node>> {
        ops.iter()
            .map(|op| Self::build(op, patterns, regexes))
            .collect()
    }

    /// Check a message body (date already excised).
    pub fn matches(&self, body: &[u8]) -> bool {
        let mut found = vec![false; self.literal_count];
        if let Some(ac) = &self.literals {
            let lowered = String::from_utf8_lossy(body).to_lowercase();
            for m in ac.find_overlapping_iter(lowered.as_bytes()) {
                found[m.pattern().as_usize()] = true;
            }
        }
        self.eval(&self.root, body, &found)
    }

    fn eval(&self, node: &Node, body: &[u8], found: &[bool]) -> bool {
        match node {
            Node::And(ops) => ops.iter().all(|op| self.eval(op, body, found)),
            Node::Or(ops) => ops.iter().any(|op| self.eval(op, body, found)),
            Node::Not(ops) => !ops.iter().any(|op| self.eval(op, body, found)),
            Node::Literal(idx) => found[*idx],
            Node::Always => true,
            Node::Regex(idx) => self.regexes[*idx].is_match(body),
        }
    }
}

/// Compile a regex leaf, prefixing `(?i)` unless it is case-sensitive.
pub fn compile_regex(pattern: &str, case_sensitive: bool) -> Result<Regex> {
    let source = if case_sensitive {
        pattern.to_string()
    } else {
        format!("(?i){pattern}")
    };
    Regex::new(&source).map_err(|e| LogheapError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
