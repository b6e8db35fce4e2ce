//! Maintain command - one maintenance pass.

use crate::app::App;
use logheap_core::Config;

/// Run the maintain command.
pub fn run(config: Config) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let report = app.engine.maintain()?;

    println!("Maintenance complete!");
    println!("  Tails corrected:   {}", report.tails_corrected);
    println!("  Segments merged:   {}", report.segments_merged);
    println!("  Orphan messages:   {}", report.gc.messages);
    println!("  Orphan postings:   {}", report.gc.posting_segments);
    println!("  Queries evicted:   {}", report.queries_evicted);

    Ok(())
}
