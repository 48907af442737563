use clap::Parser;
use mirra::config::{Cli, Limits};
use mirra::registry::SessionRegistry;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let limits = match &cli.config {
        Some(path) => Limits::load(path)?,
        None => Limits::default(),
    };
    mirra::logging::init(cli.log_level.as_deref())?;

    println!("mirra v{} (type 'help' for commands)", mirra::VERSION);

    let registry = SessionRegistry::new(limits);
    mirra::repl::run(Arc::clone(&registry)).await?;

    // Drain every session before the process goes away.
    registry.stop_all().await;

    Ok(())
}
