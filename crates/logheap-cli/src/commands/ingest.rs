//! Ingest command - index new bytes of the configured log files.

use crate::app::App;
use logheap_core::Config;
use std::time::Instant;

/// Run the ingest command.
pub fn run(mut config: Config, files: Vec<String>) -> anyhow::Result<()> {
    add_patterns(&mut config, files);
    if config.ingest.files.is_empty() {
        eprintln!("No log files configured. Pass --files or set ingest.files in the config.");
        return Ok(());
    }

    let app = App::new(config)?;

    println!("Ingesting log files...");
    let start = Instant::now();
    let report = app.engine.ingest()?;
    let elapsed = start.elapsed();

    println!();
    println!("Ingestion complete!");
    println!("  Files added:     {}", report.files_added);
    println!("  Files removed:   {}", report.files_removed);
    println!("  Files rotated:   {}", report.files_rotated);
    println!("  Tasks:           {}", report.tasks);
    println!("  Segments:        {}", report.segments);
    println!("  Messages:        {}", report.messages);
    println!("  Tails corrected: {}", report.tails_corrected);
    println!("  Time:            {:.2}s", elapsed.as_secs_f64());

    if !report.failed_files.is_empty() {
        println!();
        println!("Skipped until the next run:");
        for path in &report.failed_files {
            println!("  ⚠ {}", path.display());
        }
    }

    Ok(())
}

/// Track `extra` next to the configured patterns. Files the configuration
/// tracks stay tracked, so their segments are kept.
fn add_patterns(config: &mut Config, extra: Vec<String>) {
    for pattern in extra {
        if !config.ingest.files.contains(&pattern) {
            config.ingest.files.push(pattern);
        }
    }
}
