//! Execution of one testset on its own pool of test case workers.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use super::queue::WorkQueue;
use super::results::{ResultsAggregate, TestCaseRecord, TestSetSummary};
use crate::connector::Session;
use crate::manifest::TestSetDefinition;
use crate::report::{Reporter, guarded};
use crate::testcase::{TestCaseUnit, TestSetInfo};

/// Everything a test case worker needs, shared by all workers of a testset.
struct WorkerContext {
    queue: WorkQueue<TestCaseUnit>,
    info: Arc<TestSetInfo>,
    session: Option<Arc<dyn Session>>,
    results: Arc<ResultsAggregate>,
    reporter: Arc<dyn Reporter>,
}

/// A testset scheduled for execution.
pub struct TestSet {
    shared: Arc<WorkerContext>,
    units: Vec<TestCaseUnit>,
    threads: usize,
    workers: Vec<JoinHandle<()>>,
}

impl TestSet {
    /// Creates a testset. A missing or non-positive `THREADS` falls back to
    /// `default_threads`.
    pub fn new(
        definition: &TestSetDefinition,
        units: Vec<TestCaseUnit>,
        default_threads: usize,
        session: Option<Arc<dyn Session>>,
        results: Arc<ResultsAggregate>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let threads = match definition.threads {
            Some(n) if n > 0 => n as usize,
            Some(n) => {
                warn!(
                    "Testset [{}] has THREADS = {}; using {} instead",
                    definition.name, n, default_threads
                );
                default_threads
            }
            None => default_threads,
        };

        Self {
            shared: Arc::new(WorkerContext {
                queue: WorkQueue::new(),
                info: Arc::new(TestSetInfo::from(definition)),
                session,
                results,
                reporter,
            }),
            units,
            threads: threads.max(1),
            workers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.info.name
    }

    pub fn info(&self) -> &TestSetInfo {
        &self.shared.info
    }

    /// Worker count this testset runs with.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Spawns `count` test case workers. They wait on the queue until it is
    /// closed.
    pub fn start_testcase_threads(&mut self, count: usize) {
        for worker in 0..count {
            let shared = Arc::clone(&self.shared);
            let span = Span::current();
            self.workers
                .push(tokio::spawn(testcase_worker(shared, worker).instrument(span)));
        }
        debug!("Started {} testcase worker(s)", count);
    }

    /// Moves every unit onto the queue.
    pub fn populate_testcase_queue(&mut self) {
        for unit in self.units.drain(..) {
            self.shared.queue.put(unit);
        }
    }

    /// Waits for every queued unit, then stops the workers.
    pub async fn join(&mut self) {
        self.shared.queue.join().await;
        self.shared.queue.close();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!("Testcase worker ended abnormally: {}", e);
            }
        }
    }

    /// Runs the testset to completion and returns its summary.
    pub async fn run(mut self) -> TestSetSummary {
        let span = info_span!("testset", name = %self.name());
        async move {
            let total = self.units.len();
            info!(
                "Started executing testset with {} testcase(s) on {} worker(s)",
                total, self.threads
            );
            self.shared.results.register_testset(self.name());
            guarded(
                "on_testset_start",
                self.shared.reporter.on_testset_start(self.info(), total),
            )
            .await;

            self.start_testcase_threads(self.threads);
            self.populate_testcase_queue();
            self.join().await;

            let records = self.shared.results.records_for(self.name());
            let summary = TestSetSummary::new(self.info(), records);
            guarded(
                "on_testset_complete",
                self.shared.reporter.on_testset_complete(&summary),
            )
            .await;
            info!("Finished executing testset");
            summary
        }
        .instrument(span)
        .await
    }
}

async fn testcase_worker(shared: Arc<WorkerContext>, worker: usize) {
    while let Some(unit) = shared.queue.get().await {
        let _done = shared.queue.done_on_drop();
        debug!("Worker {} picked testcase {}", worker, unit.id());

        let outcome = unit
            .execute(Arc::clone(&shared.info), shared.session.clone())
            .await;
        let commserv = shared.session.as_ref().map(|s| s.commserv_name());
        let record = TestCaseRecord::from_outcome(outcome, commserv);

        shared.results.append(&shared.info.name, record.clone());
        guarded(
            "on_testcase_complete",
            shared.reporter.on_testcase_complete(&shared.info.name, &record),
        )
        .await;
    }
}
