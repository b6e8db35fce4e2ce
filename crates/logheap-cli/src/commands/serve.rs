//! Serve command - ingest and maintain on timers.

use crate::app::App;
use crossbeam_channel::{bounded, never, select, tick, Receiver};
use logheap_core::Config;
use std::io::{self, Read};
use std::thread;
use tracing::{debug, error, info, warn};

enum Wake {
    Stop,
    Ingest,
    Maintain,
}

/// Signal once stdin reaches EOF.
fn stdin_closed() -> anyhow::Result<Receiver<()>> {
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("logheap-stdin".to_string())
        .spawn(move || {
            let mut sink = [0u8; 256];
            let mut stdin = io::stdin().lock();
            while matches!(stdin.read(&mut sink), Ok(n) if n > 0) {}
            debug!("stdin closed");
            let _ = tx.send(());
        })?;
    Ok(rx)
}

/// Run the serve command.
pub fn run(config: Config, cycles: Option<usize>, ignore_stdin: bool) -> anyhow::Result<()> {
    let ingest_every = config.ingest_interval();
    let maintain_every = config.maintenance_interval();
    let app = App::new(config)?;
    let engine = app.engine.clone();

    println!("Serving: ingesting every {:?}, maintaining every {:?}", ingest_every, maintain_every);
    if ignore_stdin {
        println!("Press Ctrl+C to stop.");
    } else {
        println!("Press Ctrl+C or Ctrl+D to stop.");
    }
    println!();

    let ingest_ticker = tick(ingest_every);
    let maintain_ticker = tick(maintain_every);
    let stop = if ignore_stdin { never() } else { stdin_closed()? };
    let mut completed = 0;

    'serve: loop {
        match engine.ingest() {
            Ok(report) => {
                if !report.failed_files.is_empty() {
                    warn!(failed = report.failed_files.len(), "some files were skipped");
                }
                info!(
                    segments = report.segments,
                    messages = report.messages,
                    "ingestion cycle done"
                );
            }
            Err(e) => error!(error = %e, "ingestion cycle failed"),
        }

        completed += 1;
        if cycles.is_some_and(|limit| completed >= limit) {
            break 'serve;
        }

        // Maintenance runs between ingestion cycles until the next one is due
        loop {
            let wake = select! {
                recv(stop) -> _ => Wake::Stop,
                recv(ingest_ticker) -> _ => Wake::Ingest,
                recv(maintain_ticker) -> _ => Wake::Maintain,
            };
            match wake {
                Wake::Stop => break 'serve,
                Wake::Ingest => break,
                Wake::Maintain => {
                    if let Err(e) = engine.maintain() {
                        error!(error = %e, "maintenance failed");
                    }
                }
            }
        }
    }

    engine.save()?;
    println!("Stopped after {} ingestion cycles.", completed);
    Ok(())
}
