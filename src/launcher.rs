//! Detached execution path.
//!
//! The dispatcher authorizes a submission, records it as `pending` and
//! re-executes this binary as a detached child running `run --job-id`. The
//! child inherits nothing: stdio is nulled and it gets its own process group,
//! so it outlives the caller. Arguments travel as an argument vector; no
//! shell ever sees them.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::allowlist::AllowList;
use crate::error::{LaunchError, ParamError, StoreError};
use crate::params::{Params, query_to_tokens};
use crate::runner::JobRequest;
use crate::state_machine::{JobId, JobRecord};
use crate::store::StatusStore;

#[cfg(windows)]
use windows_sys::Win32::System::Threading::{
    CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW, DETACHED_PROCESS,
};

/// Program and argument vector of a detached child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    program: PathBuf,
    args: Vec<OsString>,
}

impl LaunchPlan {
    /// Build the child command line for an already recorded job. Parameters
    /// arrive URL-encoded and are handed over as `key=value` tokens after a
    /// `--`, so values starting with `-` are never read as flags.
    pub fn build(
        program: impl Into<PathBuf>,
        config_path: Option<&Path>,
        job: &JobRecord,
        query: &str,
    ) -> Self {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(path) = config_path {
            args.push("--config".into());
            args.push(path.into());
        }
        args.extend(
            [
                "run".to_string(),
                "--job-id".to_string(),
                job.id.to_string(),
                "--priority".to_string(),
                job.priority.to_string(),
                "--retries".to_string(),
                job.retry.attempts.to_string(),
                "--retry-delay".to_string(),
                job.retry.delay_secs.to_string(),
                "--".to_string(),
                job.handler.clone(),
                job.method.clone(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.extend(query_to_tokens(query).into_iter().map(OsString::from));
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Start the child without waiting for it. Returns its pid.
    pub fn spawn(&self) -> Result<u32, LaunchError> {
        let mut command = Command::new(self.program());
        command
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut command);
        let child = command.spawn().map_err(LaunchError::Spawn)?;
        Ok(child.id())
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt as _;
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt as _;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

#[cfg(all(not(unix), not(windows)))]
fn detach(_command: &mut Command) {}

/// What happened to a detached submission.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Not on the allow-list; nothing was recorded.
    Unauthorized,
    /// A parameter token or option was malformed; nothing was recorded.
    Rejected(ParamError),
    Launched { job_id: JobId, pid: u32 },
    /// The record exists but no child started; it stays `pending`.
    LaunchFailed { job_id: JobId, error: LaunchError },
}

/// Asynchronous entry point.
pub struct Dispatcher {
    allowlist: Arc<AllowList>,
    status: StatusStore,
    program: PathBuf,
    config_path: Option<PathBuf>,
}

impl Dispatcher {
    pub fn new(allowlist: Arc<AllowList>, status: StatusStore, program: impl Into<PathBuf>) -> Self {
        Self {
            allowlist,
            status,
            program: program.into(),
            config_path: None,
        }
    }

    /// Dispatcher that re-executes the running binary.
    pub fn for_current_exe(allowlist: Arc<AllowList>, status: StatusStore) -> Result<Self, LaunchError> {
        let program = std::env::current_exe().map_err(LaunchError::CurrentExe)?;
        Ok(Self::new(allowlist, status, program))
    }

    /// Pass `--config <path>` to every child.
    pub fn with_config(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn dispatch(&self, request: &JobRequest) -> Result<DispatchOutcome, StoreError> {
        if !self.allowlist.validate(&request.handler, &request.method) {
            warn!(
                target: "background_jobs",
                handler = %request.handler,
                method = %request.method,
                "unauthorized job execution attempt"
            );
            return Ok(DispatchOutcome::Unauthorized);
        }
        let params = match Params::parse(&request.tokens) {
            Ok(params) => params,
            Err(e) => {
                error!(target: "background_jobs", handler = %request.handler, error = %e, "malformed job parameters");
                return Ok(DispatchOutcome::Rejected(e));
            }
        };
        if let Err(e) = request.options.check() {
            error!(target: "background_jobs", handler = %request.handler, error = %e, "job options rejected");
            return Ok(DispatchOutcome::Rejected(e));
        }

        let job = JobRecord::new(
            request.handler.as_str(),
            request.method.as_str(),
            params,
            request.options,
        );
        self.status.create(&job)?;

        let plan = LaunchPlan::build(
            &self.program,
            self.config_path.as_deref(),
            &job,
            &job.params.to_query(),
        );
        debug!(
            job_id = %job.id,
            program = %plan.program().display(),
            args = ?plan.args(),
            "spawning detached child"
        );
        match plan.spawn() {
            Ok(pid) => {
                info!(
                    target: "background_jobs",
                    job_id = %job.id,
                    handler = %job.handler,
                    method = %job.method,
                    pid,
                    "detached job launched"
                );
                Ok(DispatchOutcome::Launched { job_id: job.id, pid })
            }
            Err(e) => {
                error!(target: "background_jobs", job_id = %job.id, error = %e, "detached launch failed");
                Ok(DispatchOutcome::LaunchFailed { job_id: job.id, error: e })
            }
        }
    }
}
