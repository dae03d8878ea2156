//! SiteKB CLI: turn a website into a searchable, question-answering
//! knowledge base.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;
use sitekb_shared::SiteKbError;

use commands::Cli;

/// Exit code when a run finished but produced no usable records.
const EXIT_NOTHING_EXTRACTED: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);

    match commands::run(cli).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(report) => match report.downcast_ref::<SiteKbError>() {
            Some(e @ SiteKbError::NothingExtracted { .. }) => {
                eprintln!("{e}");
                eprintln!("Try a different URL, widen --include, or lower --min-content-chars.");
                Ok(ExitCode::from(EXIT_NOTHING_EXTRACTED))
            }
            _ => Err(report),
        },
    }
}
