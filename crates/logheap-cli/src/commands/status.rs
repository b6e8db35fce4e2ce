//! Status command - show index status and statistics.

use crate::app::App;
use logheap_core::Config;

/// Run the status command.
pub fn run(config: Config) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let status = app.engine.status()?;
    let stats = &status.stats;

    println!("Logheap Index Status");
    println!("====================");
    println!();

    if stats.segments == 0 {
        println!("Index is empty. Run 'logheap ingest' to build the index.");
    } else {
        println!("Summary:");
        println!("  Files:         {}", stats.files);
        println!("  Segments:      {}", stats.segments);
        println!("  Messages:      {}", stats.messages);
        println!("  Tail messages: {}", stats.tail_messages);
        println!("  Terms:         {}", stats.terms);
        println!("  Queries:       {}", stats.queries);
        println!(
            "  Indexed:       {} bytes ({:.2} MB)",
            stats.indexed_bytes,
            stats.indexed_bytes as f64 / (1024.0 * 1024.0)
        );
    }

    println!();
    println!("Log patterns:");
    for pattern in &app.engine.config().ingest.files {
        println!("  {}", pattern);
    }

    // Show data directory
    println!();
    println!("Data directory: {}", status.storage_dir.display());

    Ok(())
}
