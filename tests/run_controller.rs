//! End-to-end runs of the controller with in-process test cases, connector
//! and notifier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{Value, json};

use cvrun::config::Config;
use cvrun::connector::{ConnectionError, Connector, DbPayload, DbUpdateError, Session};
use cvrun::manifest::{CommcellEndpoint, RunFilter, RunManifest};
use cvrun::orchestrator::{RunController, RunOutcome};
use cvrun::orchestrator::{TestCaseRecord, TestSetSummary};
use cvrun::report::{Mail, Notifier, NullReporter, ReportError, Reporter};
use cvrun::testcase::{
    TestCase, TestCaseDescriptor, TestCaseRegistry, TestContext, TestSetInfo, TestStatus,
};

// -- test cases --------------------------------------------------------------

#[derive(Clone, Copy)]
enum Behaviour {
    Pass,
    Fail,
    Error,
    Panic,
    PassThenBrokenTearDown,
    FailThenPanickingTearDown,
}

struct Scripted(Behaviour);

#[async_trait]
impl TestCase for Scripted {
    async fn run(&mut self, ctx: &mut TestContext) -> anyhow::Result<()> {
        tokio::task::yield_now().await;
        match self.0 {
            Behaviour::Pass | Behaviour::PassThenBrokenTearDown => ctx.pass(),
            Behaviour::Fail | Behaviour::FailThenPanickingTearDown => {
                ctx.fail("restored data does not match")
            }
            Behaviour::Error => bail!("connection reset by peer"),
            Behaviour::Panic => panic!("index out of bounds"),
        }
        Ok(())
    }

    async fn tear_down(&mut self, _ctx: &TestContext) -> anyhow::Result<()> {
        match self.0 {
            Behaviour::PassThenBrokenTearDown => bail!("could not delete backupset"),
            Behaviour::FailThenPanickingTearDown => panic!("cleanup exploded"),
            _ => Ok(()),
        }
    }
}

fn registry(cases: &[(u64, Behaviour)]) -> TestCaseRegistry {
    let mut registry = TestCaseRegistry::new();
    for &(id, behaviour) in cases {
        registry.register(
            TestCaseDescriptor::new(id, format!("testcase {id}"))
                .with_product("FS")
                .with_os("UNIX"),
            move || Box::new(Scripted(behaviour)) as Box<dyn TestCase>,
        );
    }
    registry
}

// -- connector ---------------------------------------------------------------

struct FakeSession {
    host: String,
    uploads: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl Session for FakeSession {
    fn commserv_name(&self) -> &str {
        &self.host
    }

    fn version(&self) -> &str {
        "11.32.4"
    }

    async fn update_results(&self, payload: &DbPayload) -> Result<(), DbUpdateError> {
        let value = serde_json::to_value(payload).map_err(|e| DbUpdateError::Transport(e.to_string()))?;
        self.uploads.lock().unwrap().push(value);
        Ok(())
    }
}

/// Logs in to every host except the ones listed as down. Clones share
/// their recorded attempts and uploads.
#[derive(Clone, Default)]
struct FakeConnector {
    down: Vec<String>,
    attempts: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<Vec<Value>>>,
}

impl FakeConnector {
    fn with_down(hosts: &[&str]) -> Self {
        Self {
            down: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn login(&self, endpoint: &CommcellEndpoint) -> Result<Arc<dyn Session>, ConnectionError> {
        let host = endpoint.display_host().to_string();
        self.attempts.lock().unwrap().push(host.clone());
        if self.down.contains(&host) {
            return Err(ConnectionError::Login {
                host,
                reason: "connection refused".into(),
            });
        }
        Ok(Arc::new(FakeSession {
            host,
            uploads: Arc::clone(&self.uploads),
        }))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

// -- notifier ----------------------------------------------------------------

#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<Mail>>>);

#[async_trait]
impl Notifier for Outbox {
    async fn send(&self, mail: &Mail) -> Result<(), ReportError> {
        self.0.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

// -- reporter ----------------------------------------------------------------

/// Reporter whose every hook panics, like a console reporter writing to a
/// closed stdout.
struct BrokenReporter;

#[async_trait]
impl Reporter for BrokenReporter {
    async fn on_testset_start(&self, _testset: &TestSetInfo, _testcases: usize) {
        panic!("failed printing to stdout: Broken pipe");
    }

    async fn on_testcase_complete(&self, _testset: &str, _record: &TestCaseRecord) {
        panic!("failed printing to stdout: Broken pipe");
    }

    async fn on_testset_complete(&self, _summary: &TestSetSummary) {
        panic!("failed printing to stdout: Broken pipe");
    }

    async fn on_run_complete(&self, _outcome: &RunOutcome) {
        panic!("failed printing to stdout: Broken pipe");
    }
}

// -- helpers -----------------------------------------------------------------

struct Harness {
    _dir: tempfile::TempDir,
    config: Config,
    connector: FakeConnector,
    outbox: Outbox,
}

impl Harness {
    fn new() -> Self {
        Self::with_connector(FakeConnector::default())
    }

    fn with_connector(connector: FakeConnector) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.report.output_dir = dir.path().to_path_buf();
        Self {
            _dir: dir,
            config,
            connector,
            outbox: Outbox::default(),
        }
    }

    async fn run(&self, manifest: Value, registry: TestCaseRegistry, filter: RunFilter) -> RunOutcome {
        self.run_reporting(manifest, registry, filter, NullReporter).await
    }

    async fn run_reporting(
        &self,
        manifest: Value,
        registry: TestCaseRegistry,
        filter: RunFilter,
        reporter: impl Reporter + 'static,
    ) -> RunOutcome {
        let manifest = RunManifest::from_value(manifest).unwrap();
        RunController::new(
            self.config.clone(),
            manifest,
            registry,
            self.connector.clone(),
            self.outbox.clone(),
        )
        .with_reporter(reporter)
        .with_filter(filter)
        .run()
        .await
    }

    fn report_path(&self) -> std::path::PathBuf {
        self.config.report.html_path()
    }
}

fn statuses(outcome: &RunOutcome) -> HashMap<u64, TestStatus> {
    outcome
        .records
        .values()
        .flatten()
        .map(|r| (r.id, r.status))
        .collect()
}

fn endpoint(host: &str) -> Value {
    json!({
        "webconsoleHostname": host,
        "commcellUsername": "admin",
        "commcellPassword": "secret"
    })
}

// -- scenarios ---------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_results_exit_one() {
    let harness = Harness::new();
    let registry = registry(&[(1, Behaviour::Pass), (2, Behaviour::Fail), (3, Behaviour::Pass)]);
    let outcome = harness
        .run(
            json!({
                "jobID": "nightly",
                "testsetConfig": { "THREADS": 2 },
                "testsets": {
                    "A": { "THREADS": 2, "testCases": { "1": {}, "2": {} } },
                    "B": { "THREADS": 1, "testCases": { "3": {} } }
                }
            }),
            registry,
            RunFilter::new(),
        )
        .await;

    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(outcome.records["A"].len(), 2);
    assert_eq!(outcome.records["B"].len(), 1);
    let statuses = statuses(&outcome);
    assert_eq!(statuses[&1], TestStatus::Passed);
    assert_eq!(statuses[&2], TestStatus::Failed);
    assert_eq!(statuses[&3], TestStatus::Passed);
    assert_eq!(outcome.summaries.len(), 2);
    assert!(harness.report_path().exists());
}

#[tokio::test]
async fn test_empty_testsets_exit_zero() {
    let harness = Harness::new();
    let outcome = harness
        .run(json!({ "testsets": {} }), TestCaseRegistry::new(), RunFilter::new())
        .await;

    assert_eq!(outcome.exit_code(), 0);
    assert!(outcome.records.is_empty());
    let html = std::fs::read_to_string(harness.report_path()).unwrap();
    assert!(html.contains("No testcases were executed in this run."));
}

#[tokio::test]
async fn test_filter_matching_nothing_runs_no_testsets() {
    let harness = Harness::new();
    let outcome = harness
        .run(
            json!({ "testsets": { "A": { "testCases": [1] }, "B": { "testCases": [2] } } }),
            registry(&[(1, Behaviour::Fail), (2, Behaviour::Fail)]),
            RunFilter::new().with_testsets(["nope"]),
        )
        .await;

    assert_eq!(outcome.exit_code(), 0);
    assert!(outcome.records.is_empty());
    assert!(outcome.summaries.is_empty());
    let html = std::fs::read_to_string(harness.report_path()).unwrap();
    assert!(html.contains("No testcases were executed in this run."));
}

#[tokio::test]
async fn test_testset_without_testcases_still_reports_summary() {
    let harness = Harness::new();
    let outcome = harness
        .run(
            json!({ "testsets": { "EMPTY": { "testCases": {} }, "A": { "testCases": [1] } } }),
            registry(&[(1, Behaviour::Pass)]),
            RunFilter::new(),
        )
        .await;

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.summaries.len(), 2);
    let empty = outcome
        .summaries
        .iter()
        .find(|s| s.testset_name == "EMPTY")
        .unwrap();
    assert!(empty.testcases.is_empty());
}

#[tokio::test]
async fn test_filter_emptied_testset_is_skipped() {
    let harness = Harness::new();
    let outcome = harness
        .run(
            json!({ "testsets": { "A": { "testCases": [1] }, "B": { "testCases": [2] } } }),
            registry(&[(1, Behaviour::Pass), (2, Behaviour::Pass)]),
            RunFilter::new().with_testcases([1]),
        )
        .await;

    assert_eq!(outcome.summaries.len(), 1);
    assert_eq!(outcome.records.keys().collect::<Vec<_>>(), vec!["A"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_reporter_does_not_lose_records() {
    let harness = Harness::new();
    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        harness.run_reporting(
            json!({ "testsets": { "A": { "THREADS": 1, "testCases": [1, 2] } } }),
            registry(&[(1, Behaviour::Pass), (2, Behaviour::Pass)]),
            RunFilter::new(),
            BrokenReporter,
        ),
    )
    .await
    .expect("run hung after a reporter panic");

    assert_eq!(outcome.records["A"].len(), 2);
    assert_eq!(outcome.summaries.len(), 1);
    assert_eq!(outcome.exit_code(), 0);
}

// -- properties --------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_are_isolated_per_testcase() {
    let harness = Harness::new();
    let registry = registry(&[
        (1, Behaviour::Panic),
        (2, Behaviour::Pass),
        (3, Behaviour::Error),
        (4, Behaviour::Pass),
    ]);
    let outcome = harness
        .run(
            json!({
                "testsets": {
                    "A": { "THREADS": 2, "testCases": [1, 2, 3, 4, 99] }
                }
            }),
            registry,
            RunFilter::new(),
        )
        .await;

    let records = &outcome.records["A"];
    assert_eq!(records.len(), 5);
    let by_id: HashMap<u64, _> = records.iter().map(|r| (r.id, r)).collect();
    assert_eq!(by_id[&1].status, TestStatus::Failed);
    assert!(by_id[&1].summary.contains("index out of bounds"));
    assert_eq!(by_id[&2].status, TestStatus::Passed);
    assert_eq!(by_id[&3].status, TestStatus::Failed);
    assert!(by_id[&3].summary.contains("connection reset by peer"));
    assert_eq!(by_id[&4].status, TestStatus::Passed);
    assert_eq!(by_id[&99].status, TestStatus::Failed);
    assert_eq!(by_id[&99].summary, "no test case registered for id 99");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_queued_testcase_is_recorded_once() {
    let harness = Harness::new();
    let mut cases = Vec::new();
    let mut testsets = serde_json::Map::new();
    for set in 0..4u64 {
        let ids: Vec<u64> = (0..6).map(|n| set * 100 + n).collect();
        cases.extend(ids.iter().map(|id| (*id, Behaviour::Pass)));
        testsets.insert(
            format!("SET{set}"),
            json!({ "THREADS": set + 1, "testCases": ids }),
        );
    }

    let outcome = harness
        .run(
            json!({ "testsetConfig": { "THREADS": 3 }, "testsets": testsets }),
            registry(&cases),
            RunFilter::new(),
        )
        .await;

    let mut ids: Vec<u64> = outcome.records.values().flatten().map(|r| r.id).collect();
    ids.sort();
    let mut expected: Vec<u64> = cases.iter().map(|(id, _)| *id).collect();
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(outcome.summaries.len(), 4);
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn test_exit_code_follows_records() {
    let harness = Harness::new();
    let manifest = json!({ "testsets": { "A": { "testCases": [1, 2] } } });

    let all_pass = harness
        .run(
            manifest.clone(),
            registry(&[(1, Behaviour::Pass), (2, Behaviour::Pass)]),
            RunFilter::new(),
        )
        .await;
    assert_eq!(all_pass.exit_code(), 0);

    let one_fails = harness
        .run(
            manifest,
            registry(&[(1, Behaviour::Pass), (2, Behaviour::Error)]),
            RunFilter::new(),
        )
        .await;
    assert_eq!(one_fails.exit_code(), 1);
}

#[tokio::test]
async fn test_filters_select_the_same_work_every_time() {
    let harness = Harness::new();
    let manifest = json!({
        "testsets": {
            "FS_UNIX": { "testCases": [1, 2] },
            "SQL_WINDOWS": { "testCases": [3] }
        }
    });
    let cases = [(1, Behaviour::Pass), (2, Behaviour::Pass), (3, Behaviour::Pass)];

    let first = harness
        .run(
            manifest.clone(),
            registry(&cases),
            RunFilter::new().with_testsets(["fs_unix"]).with_testcases([2, 3]),
        )
        .await;
    let second = harness
        .run(
            manifest,
            registry(&cases),
            RunFilter::new()
                .with_testsets(["FS_UNIX", "fs_unix"])
                .with_testcases([3, 2, 2]),
        )
        .await;

    let ids = |o: &RunOutcome| {
        let mut ids: Vec<u64> = o.records.values().flatten().map(|r| r.id).collect();
        ids.sort();
        ids
    };
    assert_eq!(ids(&first), vec![2]);
    assert_eq!(ids(&first), ids(&second));
    assert!(!first.records.contains_key("SQL_WINDOWS"));
}

#[tokio::test]
async fn test_first_successful_endpoint_wins() {
    let harness = Harness::with_connector(FakeConnector::with_down(&["cs-down"]));
    let outcome = harness
        .run(
            json!({
                "commcell": [
                    { "webconsoleHostname": "cs-nopass", "commcellUsername": "admin" },
                    endpoint("cs-down"),
                    endpoint("cs-up"),
                    endpoint("cs-spare")
                ],
                "testsets": { "A": { "testCases": [1] } }
            }),
            registry(&[(1, Behaviour::Pass)]),
            RunFilter::new(),
        )
        .await;

    assert_eq!(outcome.commserv.as_deref(), Some("cs-up"));
    assert_eq!(outcome.version.as_deref(), Some("v11 B80 SP32"));
    assert_eq!(
        *harness.connector.attempts.lock().unwrap(),
        vec!["cs-down".to_string(), "cs-up".to_string()]
    );
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn test_tear_down_never_changes_status() {
    let harness = Harness::new();
    let outcome = harness
        .run(
            json!({ "testsets": { "A": { "testCases": [1, 2] } } }),
            registry(&[
                (1, Behaviour::PassThenBrokenTearDown),
                (2, Behaviour::FailThenPanickingTearDown),
            ]),
            RunFilter::new(),
        )
        .await;

    let by_id: HashMap<u64, _> = outcome.records["A"].iter().map(|r| (r.id, r)).collect();
    assert_eq!(by_id[&1].status, TestStatus::Passed);
    assert_eq!(by_id[&2].status, TestStatus::Failed);
    assert_eq!(by_id[&2].summary, "restored data does not match");
}

// -- login, notification and upload ------------------------------------------

#[tokio::test]
async fn test_all_endpoints_down_notifies_and_skips_testsets() {
    let harness = Harness::with_connector(FakeConnector::with_down(&["cs-a", "cs-b"]));
    let outcome = harness
        .run(
            json!({
                "commcell": [endpoint("cs-a"), endpoint("cs-b")],
                "email": { "receiver": "qa@example.com" },
                "testsets": { "A": { "testCases": [1] } }
            }),
            registry(&[(1, Behaviour::Pass)]),
            RunFilter::new(),
        )
        .await;

    assert_eq!(outcome.exit_code(), 1);
    assert!(outcome.records.is_empty());
    assert_eq!(outcome.operation_failures.len(), 1);
    assert!(outcome.operation_failures[0].reason.contains("cs-a"));
    assert!(outcome.operation_failures[0].reason.contains("cs-b"));

    let mails = harness.outbox.0.lock().unwrap();
    assert_eq!(mails.len(), 1);
    assert!(mails[0].subject.starts_with("[FAILED] "));
    assert!(mails[0].body_html.contains("Login"));
}

#[tokio::test]
async fn test_numeric_job_id_uploads_results() {
    let harness = Harness::new();
    let outcome = harness
        .run(
            json!({
                "jobID": 4213,
                "commcell": endpoint("cs01"),
                "testsets": {
                    "FS_UNIX": {
                        "TESTSET_PRODUCT_NAME": "FS",
                        "TESTSET_OS_TYPE": "UNIX",
                        "TESTSET_APPLICATION_VERSION": "NA",
                        "testCases": { "1": { "ClientName": "client01" } }
                    }
                }
            }),
            registry(&[(1, Behaviour::Pass)]),
            RunFilter::new(),
        )
        .await;
    assert_eq!(outcome.exit_code(), 0);

    let uploads = harness.connector.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    let payload = &uploads[0];
    assert_eq!(payload["jobId"], 4213);
    assert_eq!(payload["servicePack"], "SP32.4");
    let testset = &payload["testset"][0];
    assert_eq!(testset["testsetName"], "FS_UNIX");
    assert_eq!(testset["featureName"], "FS");
    assert_eq!(testset["appVersionName"], "");
    assert_eq!(testset["testcases"][0]["Client Name"], "client01");
    assert_eq!(testset["testcases"][0]["Status"], "PASSED");
}

#[tokio::test]
async fn test_text_job_id_skips_upload() {
    let harness = Harness::new();
    harness
        .run(
            json!({
                "jobID": "adhoc",
                "commcell": endpoint("cs01"),
                "testsets": { "A": { "testCases": [1] } }
            }),
            registry(&[(1, Behaviour::Pass)]),
            RunFilter::new(),
        )
        .await;
    assert!(harness.connector.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_legacy_testcases_are_grouped_into_testsets() {
    let harness = Harness::new();
    let outcome = harness
        .run(
            json!({ "testcases": { "1": null, "2": { "ClientName": "c2" } } }),
            registry(&[(1, Behaviour::Pass), (2, Behaviour::Pass)]),
            RunFilter::new(),
        )
        .await;

    assert_eq!(outcome.records.keys().collect::<Vec<_>>(), vec!["FS_UNIX"]);
    assert_eq!(outcome.records["FS_UNIX"].len(), 2);
}
