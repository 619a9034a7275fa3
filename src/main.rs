use clap::Parser;

mod cleaner;
mod cli;
mod commands;
mod config;
mod evaluate;
mod logging;
mod paths;
mod records;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use config::Config;
use paths::DataPaths;

fn main() -> anyhow::Result<()> {
    // VOYAGE_API_KEY may come from a .env file in the working directory
    dotenvy::dotenv().ok();

    let args = cli::Args::parse();

    logging::init_logger(args.verbose);

    let paths = DataPaths::resolve(args.base_path)?;
    let config = Config::load_with(&paths.base_path)?;

    log::debug!("data directory: {}", paths.base_path.display());

    commands::run(args.command, config, paths)
}
