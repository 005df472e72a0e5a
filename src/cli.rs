//! Command line interface.
//!
//! [`Cli`] carries the subcommands in [`Command`] and the global flags
//! (`--config`, `--verbose`).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::runner::JobRequest;
use crate::state_machine::{JobId, JobOptions, Priority, RetryConfig};

/// bgrun: run allow-listed jobs with retries and priority gating.
#[derive(Debug, Parser)]
#[command(name = "bgrun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./bgrun.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Priority accepted on the command line, mapped to [`Priority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    High,
    Normal,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::High => Priority::High,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::Low => Priority::Low,
        }
    }
}

/// Handler, method, parameters and scheduling options of a submission.
#[derive(Debug, Args)]
pub struct JobArgs {
    /// Registered handler name.
    pub handler: String,

    /// Method on the handler.
    pub method: String,

    /// Parameters as key=value.
    pub params: Vec<String>,

    /// Seconds to wait before the first attempt.
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
    pub priority: PriorityArg,

    /// Maximum number of attempts (config default when omitted).
    #[arg(long)]
    pub retries: Option<u32>,

    /// Seconds between attempts (config default when omitted).
    #[arg(long)]
    pub retry_delay: Option<u64>,
}

impl JobArgs {
    /// Submission options, falling back to `defaults` for unset retry fields.
    pub fn options(&self, defaults: RetryConfig) -> JobOptions {
        JobOptions {
            delay_secs: self.delay,
            priority: self.priority.into(),
            retry: RetryConfig {
                attempts: self.retries.unwrap_or(defaults.attempts),
                delay_secs: self.retry_delay.unwrap_or(defaults.delay_secs),
            },
        }
    }

    pub fn into_request(self, defaults: RetryConfig, job_id: Option<JobId>) -> JobRequest {
        let options = self.options(defaults);
        JobRequest::new(self.handler, self.method)
            .tokens(self.params)
            .options(options)
            .adopt(job_id)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a job in this process and wait for it to finish.
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Take over a job already recorded by `dispatch`.
        #[arg(long)]
        job_id: Option<JobId>,
    },

    /// Record a job and run it in a detached process.
    Dispatch {
        #[command(flatten)]
        job: JobArgs,
    },

    /// List recorded jobs, newest first.
    List {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Mark a job that has not finished as failed.
    Cancel { id: JobId },

    /// Show the cached status of a handler/method pair.
    Status { handler: String, method: String },

    /// List registered handlers and their parameters.
    Handlers,
}
