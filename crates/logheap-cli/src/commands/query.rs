//! Query command - search indexed messages.

use crate::app::{self, App};
use crate::OutputFormat;
use chrono::{DateTime, Utc};
use logheap_core::Config;
use std::time::Instant;

/// Run the query command.
pub fn run(
    config: Config,
    query: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: usize,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let app = App::new(config)?;

    if app.engine.status()?.stats.segments == 0 {
        eprintln!("Index is empty. Run 'logheap ingest' first.");
        return Ok(());
    }

    let start = Instant::now();
    let handle = app.engine.query(query, from, to)?;
    let id = handle.id();
    let keywords = app::keywords(query);

    let mut shown = 0;
    for found in handle.results() {
        if shown == limit {
            handle.cancel();
            break;
        }
        app.print_found(&found, &keywords, output)?;
        shown += 1;
    }

    let outcome = handle.wait()?;
    let elapsed = start.elapsed();

    if matches!(output, OutputFormat::Text) {
        eprintln!();
        if outcome.completed {
            eprintln!(
                "Query {} found {} results in {:.3}ms",
                id,
                outcome.matched,
                elapsed.as_secs_f64() * 1000.0
            );
        } else {
            eprintln!(
                "Query {} stopped after {} results; see 'logheap results {}'",
                id, shown, id
            );
        }
    }

    Ok(())
}
