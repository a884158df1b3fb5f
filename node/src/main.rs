mod cli;
mod config;
mod log;
mod service;

use clap::Parser;

use crate::cli::Cli;
use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_cli(&cli);
    log::initialize_logging(config.log_format);
    config.validate()?;
    service::run(config).await
}
