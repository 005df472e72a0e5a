mod admin;
mod allowlist;
mod cli;
mod config;
mod error;
mod gate;
mod handlers;
mod invoker;
mod launcher;
mod logging;
mod params;
mod runner;
mod sleeper;
mod state_machine;
mod store;
mod ui;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use admin::AdminService;
use cli::{Cli, Command};
use config::BgrunConfig;
use invoker::Invoker;
use launcher::{DispatchOutcome, Dispatcher};
use runner::JobRunner;
use sleeper::TokioSleeper;
use state_machine::JobStatus;
use ui::Printer;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = BgrunConfig::load(cli.config.as_deref())?;
    logging::init(cli.verbose, config.log_format, config.log_file.as_deref())?;

    let allowlist = Arc::new(config.allowlist());
    let registry = Arc::new(handlers::builtin_registry());
    let printer = Printer::default();

    match cli.command {
        Command::Run { job, job_id } => {
            let runner = JobRunner::new(
                Invoker::new(Arc::clone(&registry), config.binding()),
                config.status_store()?,
                allowlist,
                config.gate(),
                Arc::new(TokioSleeper),
            );
            let report = runner.run(job.into_request(config.retry, job_id)).await?;
            printer.report(&report);
            if report.status != JobStatus::Completed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Dispatch { job } => {
            let dispatcher = Dispatcher::for_current_exe(allowlist, config.status_store()?)?
                .with_config(cli.config.clone());
            let outcome = dispatcher.dispatch(&job.into_request(config.retry, None))?;
            printer.dispatch(&outcome);
            if !matches!(outcome, DispatchOutcome::Launched { .. }) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::List { limit } => {
            let admin = AdminService::new(Arc::clone(config.status_store()?.jobs()));
            printer.jobs(&admin.all_jobs(limit)?);
        }
        Command::Cancel { id } => {
            let admin = AdminService::new(Arc::clone(config.status_store()?.jobs()));
            if admin.cancel(id)? {
                println!("job {id} cancelled");
            } else {
                println!("job {id} already finished, left unchanged");
            }
        }
        Command::Status { handler, method } => {
            let snapshot = config.status_store()?.snapshot(&handler, &method)?;
            printer.snapshot(&handler, &method, snapshot.as_ref());
        }
        Command::Handlers => {
            printer.handlers(&registry, &allowlist);
        }
    }

    Ok(ExitCode::SUCCESS)
}
