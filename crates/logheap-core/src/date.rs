//! Message dates: parsing and start-pattern derivation.
//!
//! Dates are described by a chrono strftime format. When no explicit
//! message-start regex is configured, one is derived from the format: a
//! message starts at a line that begins with text shaped like the date.

use crate::error::{LogheapError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::bytes::Regex;

/// Formats tried by [`detect_message_start`] when none is configured.
pub const COMMON_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%d/%b/%Y:%H:%M:%S %z",
    "%b %e %H:%M:%S",
];

/// A date format used to read message timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFormat {
    format: String,
}

impl DateFormat {
    pub fn new(format: impl Into<String>) -> Self {
        DateFormat {
            format: format.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.format
    }

    /// Parse a date substring.
    ///
    /// Formats with an offset produce that instant; formats without one are
    /// read as UTC. A date-only format yields midnight.
    pub fn parse(&self, bytes: &[u8]) -> Result<DateTime<Utc>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| LogheapError::date_parse(bytes, &self.format))?
            .trim();

        if let Ok(dt) = DateTime::parse_from_str(text, &self.format) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, &self.format) {
            return Ok(naive.and_utc());
        }
        if let Ok(date) = NaiveDate::parse_from_str(text, &self.format) {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(naive.and_utc());
            }
        }
        Err(LogheapError::date_parse(bytes, &self.format))
    }
}

/// Translate a strftime format into a regex fragment matching its output.
pub fn format_to_regex(format: &str) -> Result<String> {
    let mut out = String::with_capacity(format.len() * 4);
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4])));
            continue;
        }

        // Collect an optional modifier (`.`, `:`, a digit) and the specifier.
        let mut spec = String::new();
        while let Some(&next) = chars.peek() {
            spec.push(next);
            chars.next();
            if next.is_ascii_alphabetic() || next == '%' {
                break;
            }
        }

        let fragment = match spec.as_str() {
            "Y" => r"\d{4}",
            "C" | "y" | "m" | "d" | "H" | "I" | "M" | "S" => r"\d{2}",
            "e" | "k" | "l" => r"[ \d]\d",
            "j" => r"\d{3}",
            "b" | "h" | "a" => r"[A-Za-z]{3}",
            "B" | "A" | "Z" => r"[A-Za-z]+",
            "p" | "P" => r"[AaPp][Mm]",
            "f" => r"\d+",
            ".f" => r"(?:\.\d+)?",
            ".3f" => r"\.\d{3}",
            ".6f" => r"\.\d{6}",
            ".9f" => r"\.\d{9}",
            "3f" => r"\d{3}",
            "6f" => r"\d{6}",
            "9f" => r"\d{9}",
            "z" => r"[+-]\d{4}",
            ":z" => r"[+-]\d{2}:\d{2}",
            "F" => r"\d{4}-\d{2}-\d{2}",
            "T" => r"\d{2}:\d{2}:\d{2}",
            "R" => r"\d{2}:\d{2}",
            "D" | "x" => r"\d{2}/\d{2}/\d{2}",
            "s" => r"\d+",
            "t" => r"\t",
            "%" => "%",
            other => {
                return Err(LogheapError::ConfigError {
                    reason: format!("unsupported date format specifier %{other} in {format:?}"),
                })
            }
        };
        out.push_str(fragment);
    }

    Ok(out)
}

/// Derive a message-start pattern whose first capture group is the date.
pub fn message_start_from_format(format: &str) -> Result<String> {
    Ok(format!("(?m)^({})", format_to_regex(format)?))
}

/// Pick the first of `formats` whose derived start pattern matches the
/// beginning of `sample` and whose match parses as a date.
pub fn detect_message_start<'a>(sample: &[u8], formats: &[&'a str]) -> Option<(&'a str, String)> {
    for &format in formats {
        let Ok(pattern) = message_start_from_format(format) else {
            continue;
        };
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        let Some(caps) = re.captures(sample) else {
            continue;
        };
        let Some(date) = caps.get(1) else {
            continue;
        };
        if date.start() == 0 && DateFormat::new(format).parse(date.as_bytes()).is_ok() {
            return Some((format, pattern));
        }
    }
    None
}
