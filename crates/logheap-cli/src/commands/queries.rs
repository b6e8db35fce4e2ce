//! Queries command - list recorded queries.

use crate::app::App;
use logheap_core::Config;

/// Run the queries command.
pub fn run(config: Config) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let queries = app.engine.queries()?;

    if queries.is_empty() {
        println!("No recorded queries.");
        return Ok(());
    }

    println!("{:>6}  {:<19}  {:<8}  {:>8}  Query", "Id", "Created", "State", "Matched");
    for query in &queries {
        let state = if query.finished { "done" } else { "partial" };
        println!(
            "{:>6}  {:<19}  {:<8}  {:>8}  {}",
            query.id,
            query.created_at.format("%Y-%m-%d %H:%M:%S"),
            state,
            query.matched,
            query.text
        );
    }

    Ok(())
}
