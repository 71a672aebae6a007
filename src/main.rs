use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use sa_findings::formats::RunSummary;

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main() -> anyhow::Result<u8> {
    sa_findings::logging::init().context("init logging")?;

    let cli = sa_findings::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        sa_findings::cli::Command::Scrape(args) => {
            let summary = sa_findings::driver::run(args).await.context("scrape")?;
            print_summary(&summary);
            Ok(sa_findings::driver::exit_code(&summary))
        }
        sa_findings::cli::Command::Status(args) => {
            sa_findings::store::status(args).context("status")?;
            Ok(sa_findings::driver::EXIT_OK)
        }
        sa_findings::cli::Command::Reset(args) => {
            sa_findings::store::reset(args).context("reset")?;
            Ok(sa_findings::driver::EXIT_OK)
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "completed={} skipped={} failed={} resumed={} records={} dropped_rows={}",
        summary.completed,
        summary.skipped,
        summary.failed,
        summary.resumed,
        summary.records_written,
        summary.dropped_rows,
    );
    for failure in &summary.failures {
        println!("failed: {failure}");
    }
    if let Some(reason) = &summary.halted {
        println!("halted: {reason}");
    }
    if summary.interrupted {
        println!("interrupted: re-run to resume");
    }
}
