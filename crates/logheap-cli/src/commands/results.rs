//! Results command - page through a recorded query.

use crate::app::{self, App};
use crate::OutputFormat;
use logheap_core::{Config, QueryId};

/// Run the results command.
pub fn run(
    config: Config,
    id: u64,
    skip: usize,
    limit: usize,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let id = QueryId::new(id);

    let record = app.engine.catalog().get_query(id)?;
    let results = app.engine.results(id, skip, limit)?;
    let keywords = app::keywords(&record.text);
    for found in &results {
        app.print_found(found, &keywords, output)?;
    }

    if matches!(output, OutputFormat::Text) {
        eprintln!();
        eprintln!(
            "Showing {} of {} results for {:?}{}",
            results.len(),
            record.matched,
            record.text,
            if record.finished { "" } else { " (partial)" }
        );
    }

    Ok(())
}
