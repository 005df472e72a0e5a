use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::allowlist::AllowList;
use crate::error::BgrunError;
use crate::gate::PriorityGate;
use crate::invoker::Invoker;
use crate::params::Params;
use crate::sleeper::Sleeper;
use crate::state_machine::{
    AttemptOutcome, AttemptRecord, JobId, JobOptions, JobRecord, JobStatus, RetryController,
    RunReport, Transition,
};
use crate::store::StatusStore;

/// A submission as it arrives at either entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRequest {
    pub handler: String,
    pub method: String,
    /// Raw `key=value` tokens, in submission order.
    pub tokens: Vec<String>,
    pub options: JobOptions,
    /// Adopt a record already created by the dispatcher instead of creating one.
    pub job_id: Option<JobId>,
}

impl JobRequest {
    pub fn new(handler: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn adopt(mut self, job_id: Option<JobId>) -> Self {
        self.job_id = job_id;
        self
    }
}

/// Synchronous entry point: drives one job from submission to a final status.
pub struct JobRunner {
    invoker: Invoker,
    status: StatusStore,
    allowlist: Arc<AllowList>,
    gate: PriorityGate,
    sleeper: Arc<dyn Sleeper>,
}

impl JobRunner {
    pub fn new(
        invoker: Invoker,
        status: StatusStore,
        allowlist: Arc<AllowList>,
        gate: PriorityGate,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            invoker,
            status,
            allowlist,
            gate,
            sleeper,
        }
    }

    /// Run a job through all lifecycle phases and return its report.
    ///
    /// `Unauthorized` and `MalformedParam` are returned before any record
    /// exists. A job that exhausts its attempts is not an error: the report
    /// carries status `failed`.
    pub async fn run(&self, request: JobRequest) -> Result<RunReport, BgrunError> {
        let started_at = Utc::now();

        // SUBMIT: authorize and parse before anything is persisted
        if !self.allowlist.validate(&request.handler, &request.method) {
            warn!(
                target: "background_jobs",
                handler = %request.handler,
                method = %request.method,
                "unauthorized job execution attempt"
            );
            return Err(BgrunError::Unauthorized {
                handler: request.handler,
                method: request.method,
            });
        }
        let params = Params::parse(&request.tokens).inspect_err(|e| {
            error!(
                target: "background_jobs",
                handler = %request.handler,
                method = %request.method,
                error = %e,
                "malformed job parameters"
            );
        })?;
        request.options.check().inspect_err(|e| {
            error!(
                target: "background_jobs",
                handler = %request.handler,
                method = %request.method,
                error = %e,
                "job options rejected"
            );
        })?;

        let mut job = match request.job_id {
            Some(id) => self.adopt(id, &request)?,
            None => {
                let job = JobRecord::new(
                    request.handler.as_str(),
                    request.method.as_str(),
                    params,
                    request.options,
                );
                self.status.create(&job)?;
                info!(
                    target: "background_jobs",
                    job_id = %job.id,
                    handler = %job.handler,
                    method = %job.method,
                    priority = %job.priority,
                    "job submitted"
                );
                job
            }
        };

        // DELAY: deferred start, then make sure nobody cancelled us meanwhile
        if let Some(delay) = job.remaining_delay(Utc::now()) {
            info!(target: "background_jobs", job_id = %job.id, delay_secs = delay.as_secs(), "delaying job start");
            self.sleeper.sleep(delay).await;
        }
        if let Some(stored) = self.status.jobs().get(job.id)?
            && stored.status.is_terminal()
        {
            let stored = self.status.refresh(stored.id)?.unwrap_or(stored);
            return Ok(self.cancelled(stored, started_at));
        }

        job.advance(JobStatus::Running);
        if !self.status.record(&job)? {
            let stored = self.status.refresh(job.id)?.unwrap_or(job);
            return Ok(self.cancelled(stored, started_at));
        }
        info!(
            target: "background_jobs",
            job_id = %job.id,
            handler = %job.handler,
            method = %job.method,
            priority = %job.priority,
            "job started"
        );

        // GATE: one cooperative yield to higher-priority work
        let deferrals = self
            .gate
            .wait_for_turn(&job, self.status.jobs().as_ref(), self.sleeper.as_ref())
            .await?;

        // PROCESS: bounded attempt loop
        let max_attempts = job.retry.max_attempts();
        let mut attempts = Vec::new();
        let mut output = None;
        while let Some(attempt) = RetryController::begin_attempt(&mut job) {
            let attempt_started = Utc::now();
            debug!(target: "background_jobs", job_id = %job.id, attempt, max_attempts, "attempt started");
            let outcome = match self.invoker.invoke(&job.handler, &job.method, &job.params) {
                Ok(value) => {
                    output = Some(value);
                    AttemptOutcome::Success
                }
                Err(e) => {
                    warn!(
                        target: "background_jobs",
                        job_id = %job.id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "job attempt failed"
                    );
                    AttemptOutcome::Failure(e.to_string())
                }
            };
            attempts.push(AttemptRecord {
                attempt,
                started_at: attempt_started,
                finished_at: Utc::now(),
                error: match &outcome {
                    AttemptOutcome::Failure(reason) => Some(reason.clone()),
                    AttemptOutcome::Success => None,
                },
            });

            match RetryController::next(&mut job, outcome) {
                Transition::Retry {
                    next_attempt,
                    delay,
                    ..
                } => {
                    if !self.status.record(&job)? {
                        return self.superseded(job, attempts, deferrals, output, started_at);
                    }
                    info!(
                        target: "background_jobs",
                        job_id = %job.id,
                        next_attempt,
                        delay_secs = delay.as_secs(),
                        "retrying job"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Transition::Complete(status) => {
                    if !self.status.record(&job)? {
                        return self.superseded(job, attempts, deferrals, output, started_at);
                    }
                    if status == JobStatus::Completed {
                        info!(target: "background_jobs", job_id = %job.id, attempt, "job completed");
                    } else {
                        error!(
                            target: "background_jobs",
                            job_id = %job.id,
                            attempts = attempt,
                            error = job.error.as_deref().unwrap_or_default(),
                            "job failed after exhausting retries"
                        );
                    }
                    break;
                }
            }
        }

        Ok(RunReport::from_job(&job, attempts, deferrals, output, started_at))
    }

    fn adopt(&self, id: JobId, request: &JobRequest) -> Result<JobRecord, BgrunError> {
        match self.status.jobs().get(id)? {
            Some(job) if job.handler == request.handler && job.method == request.method => Ok(job),
            Some(job) => Err(BgrunError::JobNotFound(format!(
                "{id} is a {}@{} job",
                job.handler, job.method
            ))),
            None => Err(BgrunError::JobNotFound(id.to_string())),
        }
    }

    fn cancelled(&self, job: JobRecord, started_at: chrono::DateTime<Utc>) -> RunReport {
        info!(
            target: "background_jobs",
            job_id = %job.id,
            status = %job.status,
            "job reached a final status before starting, skipping"
        );
        RunReport::from_job(&job, Vec::new(), 0, None, started_at)
    }

    /// The durable record went final while an attempt ran (an admin cancel).
    /// The stored record wins: it is republished and becomes the report.
    fn superseded(
        &self,
        job: JobRecord,
        attempts: Vec<AttemptRecord>,
        deferrals: u32,
        output: Option<serde_json::Value>,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<RunReport, BgrunError> {
        let stored = self.status.refresh(job.id)?.unwrap_or(job);
        warn!(
            target: "background_jobs",
            job_id = %stored.id,
            status = %stored.status,
            error = stored.error.as_deref().unwrap_or_default(),
            attempts = attempts.len(),
            "job reached a final status while running, stopping"
        );
        Ok(RunReport::from_job(&stored, attempts, deferrals, output, started_at))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::admin::{AdminService, CANCELLED};
    use crate::error::{InvocationError, ParamError, StoreError};
    use crate::handlers::builtin_registry;
    use crate::invoker::{Binding, HandlerBuilder, HandlerRegistry};
    use crate::logging::testing::capture;
    use crate::sleeper::testing::RecordingSleeper;
    use crate::state_machine::{Priority, RetryConfig};
    use crate::store::{InMemoryJobStore, InMemoryStatusCache, JobStore, SNAPSHOT_TTL};

    struct Flaky;

    struct Quitter;

    /// Durable store that remembers every status it persisted, in order.
    #[derive(Default)]
    struct TransitionLog {
        inner: InMemoryJobStore,
        statuses: Mutex<Vec<JobStatus>>,
    }

    impl TransitionLog {
        fn statuses(&self) -> Vec<JobStatus> {
            self.statuses.lock().unwrap().clone()
        }
    }

    impl JobStore for TransitionLog {
        fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
            self.inner.insert(job)?;
            self.statuses.lock().unwrap().push(job.status);
            Ok(())
        }

        fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
            self.inner.get(id)
        }

        fn update(&self, job: &JobRecord) -> Result<bool, StoreError> {
            let changed = self.inner.update(job)?;
            if changed {
                self.statuses.lock().unwrap().push(job.status);
            }
            Ok(changed)
        }

        fn set_status(
            &self,
            id: JobId,
            status: JobStatus,
            error: Option<&str>,
        ) -> Result<bool, StoreError> {
            let changed = self.inner.set_status(id, status, error)?;
            if changed {
                self.statuses.lock().unwrap().push(status);
            }
            Ok(changed)
        }

        fn running(&self) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.running()
        }

        fn list(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.list(limit)
        }
    }

    fn runner_with(
        registry: HandlerRegistry,
        allowlist: AllowList,
        status: StatusStore,
    ) -> (JobRunner, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let runner = JobRunner::new(
            Invoker::new(Arc::new(registry), Binding::Lenient),
            status,
            Arc::new(allowlist),
            PriorityGate::default(),
            Arc::clone(&sleeper) as Arc<dyn Sleeper>,
        );
        (runner, sleeper)
    }

    /// Fails every call until the `succeed_at`-th one. `u32::MAX` never succeeds.
    fn flaky_runner(
        status: StatusStore,
        succeed_at: u32,
    ) -> (JobRunner, Arc<RecordingSleeper>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let registry = builtin_registry().with(
            HandlerBuilder::new("Flaky", &[], |_| Ok(Flaky))
                .method("work", &[], move |_: &mut Flaky, _| {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if call >= succeed_at {
                        Ok(call)
                    } else {
                        Err(InvocationError::Failed(format!("call {call} failed")))
                    }
                })
                .build(),
        );
        let allowlist = AllowList::builtin().permit("Flaky", ["work"]);
        let (runner, sleeper) = runner_with(registry, allowlist, status);
        (runner, sleeper, calls)
    }

    fn runner(succeed_at: u32) -> (JobRunner, Arc<RecordingSleeper>, Arc<AtomicU32>) {
        flaky_runner(StatusStore::in_memory(), succeed_at)
    }

    /// `Quitter@finish` and `Quitter@fail` cancel every running job through
    /// the admin surface before returning.
    fn quitter_runner() -> (JobRunner, Arc<RecordingSleeper>) {
        let status = StatusStore::in_memory();
        let admin = Arc::new(AdminService::new(Arc::clone(status.jobs())));
        let cancel_running = move || -> Result<(), InvocationError> {
            let running = admin
                .all_jobs(None)
                .map_err(|e| InvocationError::Failed(e.to_string()))?
                .into_iter()
                .filter(|job| job.status == JobStatus::Running);
            for job in running {
                admin
                    .cancel(job.id)
                    .map_err(|e| InvocationError::Failed(e.to_string()))?;
            }
            Ok(())
        };
        let cancel_then_fail = cancel_running.clone();
        let registry = builtin_registry().with(
            HandlerBuilder::new("Quitter", &[], |_| Ok(Quitter))
                .method("finish", &[], move |_: &mut Quitter, _| {
                    cancel_running()?;
                    Ok("finished")
                })
                .method("fail", &[], move |_: &mut Quitter, _| {
                    cancel_then_fail()?;
                    Err::<(), _>(InvocationError::Failed("gave up".into()))
                })
                .build(),
        );
        runner_with(registry, AllowList::empty().permit("Quitter", ["finish", "fail"]), status)
    }

    fn flaky(attempts: u32) -> JobRequest {
        JobRequest::new("Flaky", "work").options(JobOptions {
            retry: RetryConfig {
                attempts,
                delay_secs: 7,
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn greeter_runs_to_completion() {
        let log = Arc::new(TransitionLog::default());
        let status = StatusStore::new(
            Arc::clone(&log) as Arc<dyn JobStore>,
            Arc::new(InMemoryStatusCache::new()),
            SNAPSHOT_TTL,
        );
        let (runner, sleeper, _) = flaky_runner(status, 1);
        let request = JobRequest::new("Greeter", "sayHello")
            .tokens(["name=Ada"])
            .options(JobOptions {
                retry: RetryConfig {
                    attempts: 1,
                    delay_secs: 5,
                },
                ..Default::default()
            });

        let report = runner.run(request).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.retries(), 0);
        assert_eq!(report.output, Some(serde_json::json!("Hello, Ada!")));
        assert!(sleeper.delays().is_empty());
        assert_eq!(
            log.statuses(),
            vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
        );

        let stored = runner.status.jobs().get(report.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.current_attempt, 1);
        let snap = runner.status.snapshot("Greeter", "sayHello").unwrap().unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn always_failing_job_exhausts_attempts() {
        let (runner, sleeper, calls) = runner(u32::MAX);
        let (logs, _guard) = capture();

        let report = runner.run(flaky(4)).await.unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.attempts.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(7); 3]);

        let stored = runner.status.jobs().get(report.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.current_attempt, 4);
        assert_eq!(stored.error.as_deref(), Some("call 4 failed"));

        assert_eq!(logs.count("job attempt failed"), 4);
        assert_eq!(logs.count("retrying job"), 3);
        assert_eq!(logs.count("job failed after exhausting retries"), 1);
    }

    #[tokio::test]
    async fn job_succeeding_on_a_later_attempt_completes() {
        let (runner, sleeper, _) = runner(3);

        let report = runner.run(flaky(5)).await.unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.retries(), 2);
        assert_eq!(report.output, Some(serde_json::json!(3)));
        assert_eq!(sleeper.delays().len(), 2);
        let stored = runner.status.jobs().get(report.job_id).unwrap().unwrap();
        assert_eq!(stored.current_attempt, 3);
    }

    #[tokio::test]
    async fn unknown_method_counts_as_failed_attempt() {
        let (runner, _, _) = runner(1);
        let runner = JobRunner {
            allowlist: Arc::new(AllowList::empty().permit("Greeter", ["shout"])),
            ..runner
        };
        let request = JobRequest::new("Greeter", "shout").options(JobOptions {
            retry: RetryConfig {
                attempts: 2,
                delay_secs: 1,
            },
            ..Default::default()
        });

        let report = runner.run(request).await.unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.attempts.len(), 2);
    }

    #[tokio::test]
    async fn low_priority_job_waits_for_running_high_job() {
        let (runner, sleeper, _) = runner(1);
        let mut high = JobRecord::new(
            "SendWelcomeEmail",
            "handle",
            Params::new(),
            JobOptions {
                priority: Priority::High,
                ..Default::default()
            },
        );
        runner.status.create(&high).unwrap();
        high.advance(JobStatus::Running);
        runner.status.record(&high).unwrap();

        let request = JobRequest::new("Greeter", "sayHello")
            .tokens(["name=Ada"])
            .options(JobOptions {
                priority: Priority::Low,
                ..Default::default()
            });
        let (logs, _guard) = capture();
        let report = runner.run(request).await.unwrap();

        let waited = logs.position("waiting for higher priority job").unwrap();
        let first_attempt = logs.position("attempt started").unwrap();
        assert!(waited < first_attempt);
        assert_eq!(logs.count("waiting for higher priority job"), 1);
        assert_eq!(report.priority_deferrals, 1);
        assert_eq!(sleeper.delays().first(), Some(&Duration::from_secs(5)));
        assert_eq!(report.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn rejected_submissions_leave_no_record() {
        let (runner, _, calls) = runner(1);

        let err = runner
            .run(JobRequest::new("Flaky", "destroy"))
            .await
            .unwrap_err();
        assert!(matches!(err, BgrunError::Unauthorized { .. }));

        let err = runner
            .run(JobRequest::new("Flaky", "work").tokens(["retries"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BgrunError::MalformedParam(_)));

        assert!(runner.status.jobs().list(None).unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_delayed_job_never_runs() {
        let (runner, sleeper, calls) = runner(1);
        let job = JobRecord::new(
            "Flaky",
            "work",
            Params::new(),
            JobOptions {
                delay_secs: 60,
                ..Default::default()
            },
        );
        runner.status.create(&job).unwrap();
        runner
            .status
            .jobs()
            .set_status(job.id, JobStatus::Failed, Some("cancelled"))
            .unwrap();

        let request = JobRequest {
            job_id: Some(job.id),
            ..JobRequest::new("Flaky", "work")
        };
        let report = runner.run(request).await.unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.attempts.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(sleeper.delays().len(), 1);
        assert!(sleeper.delays()[0] <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn adopting_unknown_job_is_an_error() {
        let (runner, _, _) = runner(1);
        let request = JobRequest {
            job_id: Some(JobId::new()),
            ..JobRequest::new("Flaky", "work")
        };
        assert!(matches!(
            runner.run(request).await,
            Err(BgrunError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn out_of_range_delay_leaves_no_record() {
        let (runner, sleeper, calls) = runner(1);

        for delay_secs in [u64::MAX, 10_000_000_000_000_000] {
            let request = JobRequest::new("Flaky", "work").options(JobOptions {
                delay_secs,
                ..Default::default()
            });
            let err = runner.run(request).await.unwrap_err();
            assert!(matches!(
                err,
                BgrunError::MalformedParam(ParamError::DelayOutOfRange(d)) if d == delay_secs
            ));
        }

        assert!(runner.status.jobs().list(None).unwrap().is_empty());
        assert!(sleeper.delays().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_during_successful_attempt_is_reported() {
        let (runner, sleeper) = quitter_runner();

        let report = runner.run(JobRequest::new("Quitter", "finish")).await.unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.attempts.len(), 1);
        assert!(sleeper.delays().is_empty());

        let stored = runner.status.jobs().get(report.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some(CANCELLED));
        let snap = runner.status.snapshot("Quitter", "finish").unwrap().unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_during_failing_attempt_stops_retries() {
        let (runner, sleeper) = quitter_runner();
        let request = JobRequest::new("Quitter", "fail").options(JobOptions {
            retry: RetryConfig {
                attempts: 3,
                delay_secs: 2,
            },
            ..Default::default()
        });

        let report = runner.run(request).await.unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.attempts.len(), 1);
        assert!(sleeper.delays().is_empty());
        let stored = runner.status.jobs().get(report.job_id).unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some(CANCELLED));
        assert_eq!(stored.current_attempt, 0);
        let snap = runner.status.snapshot("Quitter", "fail").unwrap().unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
    }
}
