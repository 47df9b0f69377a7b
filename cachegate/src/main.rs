//! `cachegated` binary entry point: parse CLI flags, load config, start logging, run the server.
use clap::Parser;

use cachegate::config::{Cli, ConfigHandle};
use cachegate::server::CacheGate;
use cachegate::vsl;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    vsl::init_subscriber(&cli.log_level);

    let config = ConfigHandle::load_with_overrides(cli.config, &cli.listen)?;
    config.clone().spawn_reload_task();

    let gate = CacheGate::new(config);
    gate.run().await?;
    Ok(())
}
