//! Run orchestration.
//!
//! The [`RunController`] drives a run through its phases:
//!
//! ```text
//!   Init ─► ParsedManifest ─► LoggedIn ─► Setup ─► TestSetsRunning
//!                  │                                      │
//!                  └──► NotifyOnly ──┐                    ▼
//!                                    │               TestSetsDone
//!                                    ▼                    │
//!                                 Reported ◄──────────────┘
//!                                    │
//!                                    ▼
//!                                DbUpdated ─► Exit
//! ```
//!
//! # Concurrency
//!
//! Two levels of worker pools share one [`ResultsAggregate`]:
//!
//! - an outer pool of testset workers (`testsetConfig.THREADS`, else
//!   `harness.testset_threads`) takes testsets from a [`WorkQueue`],
//! - every [`TestSet`] runs its own pool of test case workers (`THREADS`,
//!   else `harness.testcase_threads`).
//!
//! Each worker appends its record under the aggregate's lock before it marks
//! the queue item done, so a joined queue implies complete results.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use cvrun::config::Config;
//! use cvrun::connector::ScriptConnector;
//! use cvrun::manifest::RunManifest;
//! use cvrun::orchestrator::RunController;
//! use cvrun::report::SendmailNotifier;
//! use cvrun::testcase::TestCaseRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let manifest = RunManifest::load(Path::new("run.json"))?;
//!     let registry = TestCaseRegistry::from_config(&config);
//!     let connector = ScriptConnector::new(config.connector.clone(), "/bin/sh");
//!     let notifier = SendmailNotifier::new(None, "/bin/sh");
//!
//!     let outcome = RunController::new(config, manifest, registry, connector, notifier)
//!         .run()
//!         .await;
//!
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

pub mod queue;
pub mod results;
pub mod testset;

pub use queue::{TaskDone, WorkQueue};
pub use results::{
    Counts, NO_CLIENT, OperationFailure, ResultsAggregate, TIME_FORMAT, TestCaseRecord,
    TestSetSummary,
};
pub use testset::TestSet;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use indexmap::IndexMap;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::config::Config;
use crate::connector::{
    self, ConnectionError, Connector, DbPayload, DbUpdateError, Session, service_pack,
    version_label,
};
use crate::manifest::{JobId, RunFilter, RunManifest, TestSetDefinition, convert};
use crate::report::{self, NullReporter, Notifier, Reporter, compose_mail, guarded};
use crate::testcase::{TestCaseRegistry, TestCaseUnit};

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ParsedManifest,
    LoggedIn,
    NotifyOnly,
    Setup,
    TestSetsRunning,
    TestSetsDone,
    Reported,
    DbUpdated,
    Exit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of the login phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    /// The manifest has no `commcell`; run without a session.
    NoCommcell,
    LoggedIn,
    /// Credentials without a host: nothing runs, the report is still sent.
    NotifyOnly,
    Failed,
}

/// Aggregated results of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Job label (`jobID`, or `###` when absent).
    pub job: String,
    pub commserv: Option<String>,
    /// CommServ version label such as `v11 B80 SP32`.
    pub version: Option<String>,
    /// Records per testset, in testset start order.
    pub records: IndexMap<String, Vec<TestCaseRecord>>,
    pub summaries: Vec<TestSetSummary>,
    pub operation_failures: Vec<OperationFailure>,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
}

impl RunOutcome {
    /// `true` if any test case or run-level operation failed.
    pub fn any_failed(&self) -> bool {
        !self.operation_failures.is_empty()
            || self
                .records
                .values()
                .flatten()
                .any(|r| r.status == crate::testcase::TestStatus::Failed)
    }

    /// Process exit code: 1 if anything failed, else 0.
    pub fn exit_code(&self) -> i32 {
        if self.any_failed() { 1 } else { 0 }
    }
}

/// A testset selected for execution together with its resolved units.
pub struct PlannedTestSet {
    pub definition: TestSetDefinition,
    pub units: Vec<TestCaseUnit>,
}

/// Drives one run from a parsed manifest to an exit code.
///
/// # Type Parameters
///
/// - `C`: how commcell sessions are established
/// - `N`: how the report mail is delivered
pub struct RunController<C, N> {
    config: Config,
    manifest: RunManifest,
    registry: TestCaseRegistry,
    connector: C,
    notifier: N,
    reporter: Arc<dyn Reporter>,
    filter: RunFilter,
    results: Arc<ResultsAggregate>,
    session: Option<Arc<dyn Session>>,
    phase: Phase,
    started: DateTime<Local>,
}

impl<C, N> RunController<C, N>
where
    C: Connector,
    N: Notifier,
{
    pub fn new(
        config: Config,
        manifest: RunManifest,
        registry: TestCaseRegistry,
        connector: C,
        notifier: N,
    ) -> Self {
        Self {
            config,
            manifest,
            registry,
            connector,
            notifier,
            reporter: Arc::new(NullReporter),
            filter: RunFilter::new(),
            results: Arc::new(ResultsAggregate::new()),
            session: None,
            phase: Phase::Init,
            started: Local::now(),
        }
    }

    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn with_filter(mut self, filter: RunFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn results(&self) -> &Arc<ResultsAggregate> {
        &self.results
    }

    fn enter(&mut self, phase: Phase) {
        info!("Run phase: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Runs every phase and returns the outcome. Never fails: problems are
    /// recorded in the outcome and reflected in its exit code.
    pub async fn run(mut self) -> RunOutcome {
        self.started = Local::now();
        info!("Job ID: {}", self.manifest.job_label());

        if self.manifest.needs_conversion() {
            match convert::normalize(&self.manifest, &self.registry, &self.filter) {
                Ok(converted) => self.manifest = converted,
                Err(e) => {
                    error!("Failed to convert testcases into testsets: {}", e);
                    self.results
                        .record_operation_failure(OperationFailure::new("Convert", e.to_string()));
                }
            }
        }
        self.enter(Phase::ParsedManifest);

        match self.establish_connection().await {
            LoginState::NotifyOnly | LoginState::Failed => {
                self.enter(Phase::NotifyOnly);
                let outcome = self.outcome();
                self.aggregate_and_report(&outcome).await;
                self.enter(Phase::Reported);
                self.finish(&outcome).await;
                return outcome;
            }
            LoginState::NoCommcell => {
                info!("No commcell details in the input JSON; running without a session");
                self.enter(Phase::LoggedIn);
            }
            LoginState::LoggedIn => self.enter(Phase::LoggedIn),
        }

        self.enter(Phase::Setup);
        let queue = self.build_testset_queue();

        self.enter(Phase::TestSetsRunning);
        self.run_all(queue).await;
        self.enter(Phase::TestSetsDone);

        let outcome = self.outcome();
        self.aggregate_and_report(&outcome).await;
        self.enter(Phase::Reported);

        match self.update_external_db(&outcome).await {
            Ok(()) => {}
            Err(DbUpdateError::NotConfigured) => {
                warn!("Results upload is not configured; skipping the database update")
            }
            Err(e) => error!("{}", e),
        }
        self.enter(Phase::DbUpdated);

        self.finish(&outcome).await;
        outcome
    }

    async fn finish(&mut self, outcome: &RunOutcome) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.logout().await {
                warn!("Logout failed: {}", e);
            }
        }
        guarded("on_run_complete", self.reporter.on_run_complete(outcome)).await;
        self.enter(Phase::Exit);
        info!("Exit code: {}", self.compute_exit_code(outcome));
    }

    /// Logs in to the first reachable commcell endpoint.
    ///
    /// Failures are recorded as a failed `Login` operation.
    pub async fn establish_connection(&mut self) -> LoginState {
        let Some(input) = self.manifest.commcell.clone() else {
            return LoginState::NoCommcell;
        };

        if input.is_notify_only() {
            let e = ConnectionError::MissingHost;
            error!("Failed to login: {}", e);
            self.results
                .record_operation_failure(OperationFailure::new("Login", e.to_string()));
            return LoginState::NotifyOnly;
        }

        match connector::establish_connection(&self.connector, &input).await {
            Ok(session) => {
                if let Some(label) = version_label(session.version()) {
                    info!("CommServ version: {}", label);
                }
                self.session = Some(session);
                LoginState::LoggedIn
            }
            Err(e) => {
                error!("Failed to login: {}", e);
                self.results
                    .record_operation_failure(OperationFailure::new("Login", e.to_string()));
                LoginState::Failed
            }
        }
    }

    /// Queues the selected testsets in manifest order.
    ///
    /// Testsets excluded by the filter, or left without test cases by it,
    /// are skipped with a warning. A testset that lists no test cases at all
    /// is still queued so that it reports an empty summary.
    pub fn build_testset_queue(&self) -> WorkQueue<PlannedTestSet> {
        for name in self.filter.unknown_testsets(&self.manifest) {
            warn!(
                "Testset [{}] given on the command line is not defined in the input JSON",
                name
            );
        }

        let queue = WorkQueue::new();
        for definition in self.manifest.testsets() {
            if !self.filter.admits_testset(&definition.name) {
                warn!(
                    "Testset [{}] was not selected for execution, skipping it!",
                    definition.name
                );
                continue;
            }

            let units: Vec<TestCaseUnit> = definition
                .test_cases
                .iter()
                .filter(|entry| self.filter.admits_testcase(entry.id))
                .map(|entry| self.registry.unit(entry))
                .collect();

            if units.is_empty() && !definition.test_cases.is_empty() {
                warn!(
                    "Testset [{}] has no selected testcases, skipping it!",
                    definition.name
                );
                continue;
            }

            debug!(
                "Queued testset [{}] with {} testcase(s)",
                definition.name,
                units.len()
            );
            queue.put(PlannedTestSet {
                definition: definition.clone(),
                units,
            });
        }
        queue
    }

    /// Runs every queued testset on the outer worker pool and waits for all
    /// of them.
    pub async fn run_all(&self, queue: WorkQueue<PlannedTestSet>) {
        let threads = self
            .manifest
            .testset_threads()
            .unwrap_or(self.config.harness.testset_threads)
            .max(1);
        let queue = Arc::new(queue);
        info!(
            "Running {} testset(s) on {} worker(s)",
            queue.unfinished(),
            threads
        );

        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let queue = Arc::clone(&queue);
            let default_threads = self.config.harness.testcase_threads;
            let session = self.session.clone();
            let results = Arc::clone(&self.results);
            let reporter = Arc::clone(&self.reporter);

            workers.push(tokio::spawn(
                async move {
                    while let Some(planned) = queue.get().await {
                        let _done = queue.done_on_drop();
                        let summary = TestSet::new(
                            &planned.definition,
                            planned.units,
                            default_threads,
                            session.clone(),
                            Arc::clone(&results),
                            Arc::clone(&reporter),
                        )
                        .run()
                        .await;
                        results.push_summary(summary);
                    }
                }
                .instrument(Span::current()),
            ));
        }

        queue.join().await;
        queue.close();
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Testset worker ended abnormally: {}", e);
            }
        }
    }

    /// Writes the HTML report and sends the report mail. Failures are
    /// logged, never propagated.
    pub async fn aggregate_and_report(&self, outcome: &RunOutcome) {
        let html = match report::render_html(outcome) {
            Ok(html) => {
                let path = self.config.report.html_path();
                match report::write_html(&path, &html) {
                    Ok(()) => info!("HTML report written to {}", path.display()),
                    Err(e) => error!("{}", e),
                }
                html
            }
            Err(e) => {
                error!("{}", e);
                String::new()
            }
        };

        let Some(email) = &self.manifest.email else {
            debug!("No email details in the input JSON; not sending mail");
            return;
        };

        let names: Vec<String> = self
            .manifest
            .testsets()
            .filter(|t| outcome.records.contains_key(&t.name))
            .map(|t| t.subject_name())
            .collect();

        if let Some(mail) = compose_mail(email, &self.config.email, outcome, &names, html) {
            if let Err(e) = self.notifier.send(&mail).await {
                error!("{}", e);
            }
        }
    }

    /// Uploads the results when the job id is a positive integer and a
    /// session exists.
    pub async fn update_external_db(&self, outcome: &RunOutcome) -> Result<(), DbUpdateError> {
        let Some(job_id) = self.manifest.job_id.as_ref().and_then(JobId::tracked) else {
            debug!("Job id is not a positive integer; skipping the database update");
            return Ok(());
        };
        let Some(session) = &self.session else {
            debug!("No commcell session; skipping the database update");
            return Ok(());
        };

        let payload = DbPayload {
            job_id,
            start_time: outcome.started.format(TIME_FORMAT).to_string(),
            end_time: outcome.finished.format(TIME_FORMAT).to_string(),
            service_pack: service_pack(session.version()).unwrap_or_default(),
            testset: outcome.summaries.clone(),
        };
        session.update_results(&payload).await?;
        info!("Updated automation results for job {}", job_id);
        Ok(())
    }

    pub fn compute_exit_code(&self, outcome: &RunOutcome) -> i32 {
        outcome.exit_code()
    }

    fn outcome(&self) -> RunOutcome {
        RunOutcome {
            job: self.manifest.job_label(),
            commserv: self
                .session
                .as_ref()
                .map(|s| s.commserv_name().to_string()),
            version: self.session.as_ref().and_then(|s| version_label(s.version())),
            records: self.results.snapshot(),
            summaries: self.results.summaries(),
            operation_failures: self.results.operation_failures(),
            started: self.started,
            finished: Local::now(),
        }
    }
}
