use anyhow::Error;
use clap::Parser;

use crate::program::Program;
use crate::scraper::Cli;

mod program;
mod scraper;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    Program::new(cli).run().await
}
