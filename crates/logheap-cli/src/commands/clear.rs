//! Clear command - remove all index data.

use crate::app::App;
use logheap_core::Config;
use std::io::{self, Write};

/// Run the clear command.
pub fn run(config: Config, skip_confirm: bool) -> anyhow::Result<()> {
    let app = App::new(config)?;

    let stats = app.engine.status()?.stats;
    if stats.files == 0 && stats.queries == 0 {
        println!("Nothing indexed, nothing to clear.");
        return Ok(());
    }

    if !skip_confirm {
        print!("This deletes all segments, terms and query records. Continue? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    app.engine.clear()?;
    println!("Index cleared.");

    Ok(())
}
