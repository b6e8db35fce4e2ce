//! Query text parser.
//!
//! ## Syntax
//!
//! - `error timeout` - both words (adjacent terms are AND-ed)
//! - `error AND timeout` - the same, explicitly
//! - `error OR warn` - either word; OR binds tighter than AND, so
//!   `db error OR warn` means `db AND (error OR warn)`
//! - `!debug` - messages without the word
//! - `(a b) OR c` - grouping
//! - `"connection reset"`, `'a b'` - phrases, with `\` escapes
//! - `~user=\d+` - case-insensitive regex up to the next whitespace
//! - `~~User` - case-sensitive regex; both forms accept a quoted pattern
//!
//! Keywords are case-insensitive. The empty query matches every message.

use crate::error::{LogheapError, Result};
use crate::expr::{compile_regex, Expr};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Bang,
    And,
    Or,
    Text(String),
    Regex { pattern: String, case_sensitive: bool },
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Lexer { input, pos: 0 }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn quoted(&mut self, quote: char) -> Result<String> {
        let start = self.pos;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(LogheapError::syntax(start, "unterminated quoted string")),
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(LogheapError::syntax(start, "unterminated quoted string")),
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    fn word(&mut self, stop_at_parens: bool) -> String {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() || (stop_at_parens && (c == '(' || c == ')')) {
                break;
            }
            self.bump();
        }
        self.input[start..self.pos].to_string()
    }

    /// Produce `(position, token)` pairs.
    fn tokens(mut self) -> Result<Vec<(usize, Token)>> {
        let mut out = Vec::new();
        while let Some(c) = self.peek_char() {
            let at = self.pos;
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            let token = match c {
                '(' => {
                    self.bump();
                    Token::LParen
                }
                ')' => {
                    self.bump();
                    Token::RParen
                }
                '!' => {
                    self.bump();
                    Token::Bang
                }
                '"' | '\'' => {
                    self.bump();
                    Token::Text(self.quoted(c)?)
                }
                '~' => {
                    self.bump();
                    let case_sensitive = self.peek_char() == Some('~');
                    if case_sensitive {
                        self.bump();
                    }
                    let pattern = match self.peek_char() {
                        Some(q @ ('"' | '\'')) => {
                            self.bump();
                            self.quoted(q)?
                        }
                        _ => self.word(false),
                    };
                    if pattern.is_empty() {
                        return Err(LogheapError::syntax(at, "empty regular expression"));
                    }
                    compile_regex(&pattern, case_sensitive)?;
                    Token::Regex {
                        pattern,
                        case_sensitive,
                    }
                }
                _ => {
                    let word = self.word(true);
                    if word.eq_ignore_ascii_case("and") {
                        Token::And
                    } else if word.eq_ignore_ascii_case("or") {
                        Token::Or
                    } else {
                        Token::Text(word)
                    }
                }
            };
            out.push((at, token));
        }
        Ok(out)
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    idx: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.idx).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.idx).map_or(self.end, |(p, _)| *p)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.idx).map(|(_, t)| t.clone());
        if token.is_some() {
            self.idx += 1;
        }
        token
    }

    /// A sequence of OR-groups joined by explicit or implicit AND.
    fn and_expr(&mut self) -> Result<Expr> {
        let mut operands = Vec::new();
        loop {
            match self.peek() {
                None | Some(Token::RParen) => break,
                Some(Token::And) => {
                    if operands.is_empty() {
                        return Err(LogheapError::syntax(self.position(), "AND needs a left operand"));
                    }
                    self.next();
                    operands.push(self.or_expr()?);
                }
                Some(Token::Or) => {
                    return Err(LogheapError::syntax(self.position(), "OR needs a left operand"));
                }
                Some(_) => operands.push(self.or_expr()?),
            }
        }
        Ok(Expr::And(operands))
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let first = self.unary()?;
        if self.peek() != Some(&Token::Or) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.peek() == Some(&Token::Or) {
            self.next();
            operands.push(self.unary()?);
        }
        Ok(Expr::Or(operands))
    }

    fn unary(&mut self) -> Result<Expr> {
        let at = self.position();
        match self.next() {
            Some(Token::Bang) => Ok(Expr::Not(vec![self.unary()?])),
            Some(Token::LParen) => {
                let inner = self.and_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(LogheapError::syntax(at, "unclosed parenthesis")),
                }
            }
            Some(Token::Text(text)) => Ok(Expr::Literal(text)),
            Some(Token::Regex {
                pattern,
                case_sensitive,
            }) => Ok(Expr::Regex {
                pattern,
                case_sensitive,
            }),
            Some(Token::RParen) => Err(LogheapError::syntax(at, "unexpected ')'")),
            Some(Token::And) | Some(Token::Or) => {
                Err(LogheapError::syntax(at, "expected a term, found a keyword"))
            }
            None => Err(LogheapError::syntax(at, "unexpected end of query")),
        }
    }
}

/// Parse query text into an optimized expression tree.
pub fn parse(text: &str) -> Result<Expr> {
    let tokens = Lexer::new(text).tokens()?;
    let mut parser = Parser {
        tokens,
        idx: 0,
        end: text.len(),
    };

    let expr = parser.and_expr()?;
    if parser.peek().is_some() {
        return Err(LogheapError::syntax(parser.position(), "unmatched ')'"));
    }
    Ok(expr.optimize())
}
