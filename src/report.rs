//! Run reporting: live progress, the HTML report, console tables and mail.
//!
//! Reporting never decides the outcome of a run. Every failure in this
//! module surfaces as a [`ReportError`] that callers log and swallow.

pub mod html;
pub mod mail;
pub mod table;

pub use html::{render_html, write_html};
pub use mail::{Mail, Notifier, SendmailNotifier, compose_mail};
pub use table::render_tables;

use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::error;

use crate::orchestrator::{Counts, RunOutcome, TestCaseRecord, TestSetSummary};
use crate::testcase::{TestSetInfo, TestStatus, panic_message};

/// Errors raised while producing reports or sending mail.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to render report: {0}")]
    Render(String),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send mail: {0}")]
    Mail(String),
}

/// Receives progress events while a run executes.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_testset_start(&self, _testset: &TestSetInfo, _testcases: usize) {}

    async fn on_testcase_complete(&self, _testset: &str, _record: &TestCaseRecord) {}

    async fn on_testset_complete(&self, _summary: &TestSetSummary) {}

    async fn on_run_complete(&self, _outcome: &RunOutcome) {}
}

/// Awaits a reporter hook. A panic inside the hook is logged and never
/// reaches the caller.
pub async fn guarded<F>(hook: &str, future: F)
where
    F: Future<Output = ()>,
{
    if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
        error!(
            "Reporter hook {} panicked: {}",
            hook,
            panic_message(payload.as_ref())
        );
    }
}

/// Reporter that ignores every event.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {}

/// Prints one line per finished test case and a final summary.
pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_testset_start(&self, testset: &TestSetInfo, testcases: usize) {
        let _ = writeln!(
            std::io::stdout().lock(),
            "{} {} ({} testcase(s))",
            console::style("▶").cyan(),
            console::style(&testset.name).bold(),
            testcases
        );
    }

    async fn on_testcase_complete(&self, testset: &str, record: &TestCaseRecord) {
        let status = match record.status {
            TestStatus::Passed => console::style("PASSED").green(),
            TestStatus::Failed => console::style("FAILED").red(),
            TestStatus::NotRun => console::style("NOT_RUN").yellow(),
        };
        let elapsed = record.elapsed().num_milliseconds() as f64 / 1000.0;
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "  {} {} {} ({:.1}s)", status, record.id, record.name, elapsed);
        if self.verbose && record.status == TestStatus::Failed && !record.summary.is_empty() {
            let _ = writeln!(
                out,
                "      [{}] {}",
                testset,
                console::style(&record.summary).dim()
            );
        }
    }

    async fn on_run_complete(&self, outcome: &RunOutcome) {
        let _ = write_summary(&mut std::io::stdout().lock(), outcome);
    }
}

fn write_summary(out: &mut impl Write, outcome: &RunOutcome) -> std::io::Result<()> {
    let counts = Counts::of(outcome.records.values().flatten());
    writeln!(out)?;
    writeln!(out, "Automation Results:")?;
    writeln!(out, "  Testsets: {}", outcome.records.len())?;
    writeln!(out, "  Total:    {}", counts.total)?;
    writeln!(out, "  Passed:   {}", console::style(counts.passed).green())?;
    writeln!(out, "  Failed:   {}", console::style(counts.failed).red())?;

    for failure in &outcome.operation_failures {
        writeln!(
            out,
            "  {} {}: {}",
            console::style("Operation failed:").red().bold(),
            failure.operation,
            failure.reason
        )?;
    }

    writeln!(out)?;
    if outcome.exit_code() == 0 {
        writeln!(out, "{}", console::style("All testcases passed!").green().bold())
    } else {
        writeln!(out, "{}", console::style("Some testcases failed.").red().bold())
    }
}
