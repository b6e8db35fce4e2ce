//! Application state management.

use crate::OutputFormat;
use logheap_core::{Config, Engine, FoundMessage};
use std::io::IsTerminal;
use std::sync::Arc;
use tracing::info;

/// Shared application state.
pub struct App {
    /// The engine, shared with background loops
    pub engine: Arc<Engine>,
}

impl App {
    /// Open the engine for `config`.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let engine = Engine::open(config)?;
        let status = engine.status()?;

        info!(
            data_dir = %status.storage_dir.display(),
            files = status.stats.files,
            segments = status.stats.segments,
            "Application initialized"
        );

        Ok(App {
            engine: Arc::new(engine),
        })
    }

    /// Print one match with its message text. In text output on a terminal
    /// the `keywords` are shown in bold.
    pub fn print_found(
        &self,
        found: &FoundMessage,
        keywords: &[String],
        output: OutputFormat,
    ) -> anyhow::Result<()> {
        let path = self
            .engine
            .catalog()
            .file(found.file)?
            .map(|f| f.path.display().to_string())
            .unwrap_or_else(|| format!("<file {}>", found.file));
        let text = match self.engine.message_text(found) {
            Ok(text) => text,
            Err(e) => format!("<unreadable: {e}>"),
        };

        match output {
            OutputFormat::Text => {
                let text = text.trim_end();
                if std::io::stdout().is_terminal() {
                    println!("{}:{} {}", path, found.loc.from, highlight(text, keywords));
                } else {
                    println!("{}:{} {}", path, found.loc.from, text);
                }
            }
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "path": path,
                    "from": found.loc.from,
                    "to": found.loc.to,
                    "date": found.date.to_rfc3339(),
                    "text": text.trim_end(),
                });
                println!("{}", json);
            }
        }
        Ok(())
    }
}

/// Query keywords of `text` for highlighting, empty when it does not parse.
pub fn keywords(query: &str) -> Vec<String> {
    logheap_core::parse(query)
        .map(|expr| expr.keywords().into_iter().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Wrap case-insensitive occurrences of `keywords` in bold escapes.
fn highlight(text: &str, keywords: &[String]) -> String {
    // ASCII lowering keeps byte offsets aligned with `text`
    let lower = text.to_ascii_lowercase();
    let mut marked = vec![false; text.len()];
    for keyword in keywords.iter().filter(|k| !k.is_empty()) {
        let needle = keyword.to_ascii_lowercase();
        for (start, _) in lower.match_indices(&needle) {
            marked[start..start + needle.len()].fill(true);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut bold = false;
    for (i, c) in text.char_indices() {
        if marked[i] != bold {
            out.push_str(if marked[i] { "\x1b[1m" } else { "\x1b[0m" });
            bold = marked[i];
        }
        out.push(c);
    }
    if bold {
        out.push_str("\x1b[0m");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highlight() {
        let keywords = vec!["time".to_string(), "OUT".to_string()];
        assert_eq!(
            highlight("db Timeout, out", &keywords),
            "db \x1b[1mTimeout\x1b[0m, \x1b[1mout\x1b[0m"
        );
        assert_eq!(highlight("nothing here", &keywords), "nothing here");
    }

    #[test]
    fn test_keywords_skip_negated() {
        assert_eq!(keywords("timeout !retry"), vec!["timeout".to_string()]);
        assert!(keywords("(broken").is_empty());
    }
}
