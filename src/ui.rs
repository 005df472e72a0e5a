//! Terminal output for the CLI.
//!
//! Colours come from `console`; they switch off by themselves when stdout is
//! not a terminal.

use console::Style;

use crate::allowlist::AllowList;
use crate::invoker::HandlerRegistry;
use crate::launcher::DispatchOutcome;
use crate::state_machine::{JobRecord, JobStatus, RunReport};
use crate::store::StatusSnapshot;

pub struct Printer {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Default for Printer {
    fn default() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }
}

impl Printer {
    fn status_style(&self, status: JobStatus) -> &Style {
        match status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            JobStatus::Pending | JobStatus::Running => &self.yellow,
        }
    }

    /// Result line, retry lines and the report as JSON.
    pub fn report(&self, report: &RunReport) {
        for attempt in report.attempts.iter().filter(|a| a.error.is_some()) {
            println!(
                "  {} Attempt {}/{}: {}",
                self.yellow.apply_to("↻"),
                attempt.attempt,
                report.max_attempts,
                attempt.error.as_deref().unwrap_or_default()
            );
        }
        match report.status {
            JobStatus::Completed => println!(
                "  {} {}@{} completed",
                self.green.apply_to("✓"),
                report.handler,
                report.method
            ),
            status => println!(
                "  {} {}@{} {status}",
                self.red.apply_to("✗"),
                report.handler,
                report.method
            ),
        }
        if report.priority_deferrals > 0 || report.retries() > 0 {
            println!(
                "  {}",
                self.dim.apply_to(format!(
                    "{} retries, {} priority deferrals",
                    report.retries(),
                    report.priority_deferrals
                ))
            );
        }
        println!();
        println!("{}", self.status_style(report.status).apply_to("─── Run Report ───"));
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
    }

    pub fn jobs(&self, jobs: &[JobRecord]) {
        if jobs.is_empty() {
            println!("{}", self.dim.apply_to("no jobs recorded"));
            return;
        }
        for job in jobs {
            println!(
                "{}  {:<9}  {:<6}  {}@{}  attempt {}/{}  {}",
                job.id,
                self.status_style(job.status).apply_to(job.status),
                job.priority,
                job.handler,
                job.method,
                job.current_attempt,
                job.retry.max_attempts(),
                self.dim.apply_to(job.created_at.to_rfc3339()),
            );
            if let Some(error) = &job.error {
                println!("    {}", self.red.apply_to(error));
            }
        }
    }

    pub fn snapshot(&self, handler: &str, method: &str, snapshot: Option<&StatusSnapshot>) {
        match snapshot {
            Some(snap) => println!(
                "{handler}@{method}: {} (priority {}, at {}) {}",
                self.status_style(snap.status).apply_to(snap.status),
                snap.priority,
                snap.timestamp.to_rfc3339(),
                self.dim.apply_to(serde_json::to_string(&snap.params).unwrap_or_default()),
            ),
            None => println!("{handler}@{method}: {}", self.dim.apply_to("no recent status")),
        }
    }

    pub fn handlers(&self, registry: &HandlerRegistry, allowlist: &AllowList) {
        for handler in registry.iter() {
            let init = handler.init_params().join(", ");
            println!("{}({init})", self.green.apply_to(handler.name()));
            for (name, method) in handler.methods() {
                let marker = if allowlist.validate(handler.name(), name) {
                    self.green.apply_to("allowed")
                } else {
                    self.dim.apply_to("not allowed")
                };
                println!("  {name}({})  {marker}", method.params().join(", "));
            }
        }
        for (handler, methods) in allowlist.iter() {
            let descriptor = registry.get(handler);
            for method in methods {
                if descriptor.and_then(|d| d.method(method)).is_none() {
                    println!(
                        "{} {handler}@{method} is allowed but not registered",
                        self.yellow.apply_to("!")
                    );
                }
            }
        }
    }

    pub fn dispatch(&self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Launched { job_id, pid } => {
                println!("  {} job {job_id} launched (pid {pid})", self.green.apply_to("✓"));
            }
            DispatchOutcome::LaunchFailed { job_id, error } => {
                println!(
                    "  {} job {job_id} recorded but not launched: {error}",
                    self.red.apply_to("✗")
                );
            }
            DispatchOutcome::Unauthorized => {
                println!("  {} job is not on the allow-list", self.red.apply_to("✗"));
            }
            DispatchOutcome::Rejected(error) => {
                println!("  {} {error}", self.red.apply_to("✗"));
            }
        }
    }
}
