//! Test case contract and execution.
//!
//! A test case is a type implementing [`TestCase`]. The harness builds one
//! instance per scheduled unit through the [`TestCaseRegistry`], then drives
//! it through `setup → run → tear_down` inside a `testcase{id,name}` span.
//!
//! Outcomes are reported through the [`TestContext`]:
//!
//! - `ctx.fail(reason)` records an expected failure,
//! - returning `Err` or panicking records an unexpected failure,
//! - returning `Ok(())` without touching the status counts as a pass.
//!
//! `tear_down` only sees the context immutably, so it cannot change the
//! recorded outcome.

pub mod command;
pub mod registry;

pub use command::CommandTestCase;
pub use registry::{TestCaseDescriptor, TestCaseFactory, TestCaseRegistry};

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Instrument, error, info, info_span, warn};

use crate::connector::Session;
use crate::manifest::{InputBag, TestSetDefinition};

/// Outcome of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    NotRun,
    Passed,
    Failed,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::NotRun => "NOT_RUN",
            TestStatus::Passed => "PASSED",
            TestStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Testset metadata visible to test cases.
#[derive(Debug, Clone, Default)]
pub struct TestSetInfo {
    pub name: String,
    pub product: String,
    pub os_type: String,
    pub application_version: String,
    pub additional_prop: String,
}

impl From<&TestSetDefinition> for TestSetInfo {
    fn from(def: &TestSetDefinition) -> Self {
        Self {
            name: def.name.clone(),
            product: def.product().to_string(),
            os_type: def.os_type().to_string(),
            application_version: def.application_version().to_string(),
            additional_prop: def.additional_prop().to_string(),
        }
    }
}

/// Everything a test case sees while it runs, plus its outcome fields.
pub struct TestContext {
    id: u64,
    name: String,
    inputs: InputBag,
    testset: Arc<TestSetInfo>,
    session: Option<Arc<dyn Session>>,
    status: TestStatus,
    result_string: String,
    client_name: Option<String>,
    url: Option<String>,
    attachments: Vec<PathBuf>,
}

impl TestContext {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        inputs: InputBag,
        testset: Arc<TestSetInfo>,
        session: Option<Arc<dyn Session>>,
    ) -> Self {
        let client_name = inputs
            .get("ClientName")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id,
            name: name.into(),
            inputs,
            testset,
            session,
            status: TestStatus::NotRun,
            result_string: String::new(),
            client_name,
            url: None,
            attachments: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &InputBag {
        &self.inputs
    }

    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// String input, or `None` if absent or not a string.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(Value::as_str)
    }

    pub fn testset(&self) -> &TestSetInfo {
        &self.testset
    }

    /// The run's commcell session, if one was established.
    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        self.session.as_ref()
    }

    pub fn status(&self) -> TestStatus {
        self.status
    }

    pub fn result_string(&self) -> &str {
        &self.result_string
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn attachments(&self) -> &[PathBuf] {
        &self.attachments
    }

    pub fn pass(&mut self) {
        self.status = TestStatus::Passed;
    }

    /// Marks the test case failed. The first reason is kept.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = TestStatus::Failed;
        if self.result_string.is_empty() {
            self.result_string = reason.into();
        }
    }

    pub fn set_client_name(&mut self, client: impl Into<String>) {
        self.client_name = Some(client.into());
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = Some(url.into());
    }

    pub fn attach(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        if !self.attachments.contains(&path) {
            self.attachments.push(path);
        }
    }
}

/// A runnable test case.
#[async_trait]
pub trait TestCase: Send {
    /// Prepares the test case. An error skips `run`.
    async fn setup(&mut self, _ctx: &mut TestContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Executes the test case body.
    async fn run(&mut self, ctx: &mut TestContext) -> anyhow::Result<()>;

    /// Cleans up. Errors are logged and never change the outcome.
    async fn tear_down(&mut self, _ctx: &TestContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a finished test case produced.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub id: u64,
    pub name: String,
    pub status: TestStatus,
    pub summary: String,
    pub client_name: Option<String>,
    pub url: Option<String>,
    pub attachments: Vec<PathBuf>,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
}

/// A scheduled test case: one manifest entry resolved against the registry.
pub struct TestCaseUnit {
    id: u64,
    name: String,
    inputs: InputBag,
    factory: Option<TestCaseFactory>,
}

impl TestCaseUnit {
    pub fn new(id: u64, name: impl Into<String>, inputs: InputBag, factory: Option<TestCaseFactory>) -> Self {
        Self {
            id,
            name: name.into(),
            inputs,
            factory,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the unit to completion. Never panics and never fails: every
    /// problem becomes a FAILED outcome.
    pub async fn execute(
        self,
        testset: Arc<TestSetInfo>,
        session: Option<Arc<dyn Session>>,
    ) -> TestOutcome {
        let span = info_span!("testcase", id = self.id, name = %self.name);
        self.execute_inner(testset, session).instrument(span).await
    }

    async fn execute_inner(
        self,
        testset: Arc<TestSetInfo>,
        session: Option<Arc<dyn Session>>,
    ) -> TestOutcome {
        let started = Local::now();
        info!("Started executing testcase {}", self.id);

        let mut ctx = TestContext::new(self.id, self.name.clone(), self.inputs, testset, session);

        match self.factory {
            None => ctx.fail(format!("no test case registered for id {}", self.id)),
            Some(factory) => match std::panic::catch_unwind(AssertUnwindSafe(|| factory())) {
                Ok(test_case) => drive(test_case, &mut ctx).await,
                Err(payload) => ctx.fail(format!(
                    "failed to initialize test case: {}",
                    panic_message(payload.as_ref())
                )),
            },
        }

        if ctx.status == TestStatus::Failed {
            error!("Testcase {} FAILED: {}", self.id, ctx.result_string);
        } else {
            info!("Testcase {} {}", self.id, ctx.status);
        }

        TestOutcome {
            id: self.id,
            name: self.name,
            status: ctx.status,
            summary: ctx.result_string,
            client_name: ctx.client_name,
            url: ctx.url,
            attachments: ctx.attachments,
            started,
            finished: Local::now(),
        }
    }
}

async fn drive(mut test_case: Box<dyn TestCase>, ctx: &mut TestContext) {
    let setup = AssertUnwindSafe(test_case.setup(ctx)).catch_unwind().await;
    let setup_ok = match setup {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            ctx.fail(format!("setup failed: {e:#}"));
            false
        }
        Err(payload) => {
            ctx.fail(format!("setup panicked: {}", panic_message(payload.as_ref())));
            false
        }
    };

    if setup_ok {
        match AssertUnwindSafe(test_case.run(ctx)).catch_unwind().await {
            Ok(Ok(())) => {
                if ctx.status == TestStatus::NotRun {
                    ctx.pass();
                }
            }
            Ok(Err(e)) => ctx.fail(format!("{e:#}")),
            Err(payload) => ctx.fail(format!("test case panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    let ctx: &TestContext = ctx;
    match AssertUnwindSafe(test_case.tear_down(ctx)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("tear_down of testcase {} failed: {:#}", ctx.id, e),
        Err(payload) => warn!(
            "tear_down of testcase {} panicked: {}",
            ctx.id,
            panic_message(payload.as_ref())
        ),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Scripted {
        behaviour: &'static str,
    }

    #[async_trait]
    impl TestCase for Scripted {
        async fn setup(&mut self, _ctx: &mut TestContext) -> anyhow::Result<()> {
            if self.behaviour == "setup-error" {
                bail!("no client");
            }
            Ok(())
        }

        async fn run(&mut self, ctx: &mut TestContext) -> anyhow::Result<()> {
            match self.behaviour {
                "pass" => ctx.pass(),
                "fail" => ctx.fail("backup job failed"),
                "error" => bail!("connection reset"),
                "panic" => panic!("index out of bounds"),
                _ => {}
            }
            ctx.attach("/tmp/run.log");
            Ok(())
        }

        async fn tear_down(&mut self, ctx: &TestContext) -> anyhow::Result<()> {
            if ctx.status() == TestStatus::Passed {
                bail!("cleanup failed");
            }
            Ok(())
        }
    }

    fn unit(behaviour: &'static str) -> TestCaseUnit {
        let factory: TestCaseFactory =
            Arc::new(move || Box::new(Scripted { behaviour }) as Box<dyn TestCase>);
        TestCaseUnit::new(7, "scripted", InputBag::new(), Some(factory))
    }

    async fn outcome(unit: TestCaseUnit) -> TestOutcome {
        unit.execute(Arc::new(TestSetInfo::default()), None).await
    }

    #[tokio::test]
    async fn test_pass_survives_failing_tear_down() {
        let outcome = outcome(unit("pass")).await;
        assert_eq!(outcome.status, TestStatus::Passed);
        assert_eq!(outcome.attachments, vec![PathBuf::from("/tmp/run.log")]);
        assert!(outcome.finished >= outcome.started);
    }

    #[tokio::test]
    async fn test_expected_failure_keeps_reason() {
        let outcome = outcome(unit("fail")).await;
        assert_eq!(outcome.status, TestStatus::Failed);
        assert_eq!(outcome.summary, "backup job failed");
    }

    #[tokio::test]
    async fn test_error_and_panic_become_failures() {
        let errored = outcome(unit("error")).await;
        assert_eq!(errored.status, TestStatus::Failed);
        assert_eq!(errored.summary, "connection reset");

        let panicked = outcome(unit("panic")).await;
        assert_eq!(panicked.status, TestStatus::Failed);
        assert!(panicked.summary.contains("index out of bounds"));
    }

    #[tokio::test]
    async fn test_setup_error_skips_run() {
        let outcome = outcome(unit("setup-error")).await;
        assert_eq!(outcome.status, TestStatus::Failed);
        assert_eq!(outcome.summary, "setup failed: no client");
        assert!(outcome.attachments.is_empty());
    }

    #[tokio::test]
    async fn test_clean_return_counts_as_pass() {
        let outcome = outcome(unit("quiet")).await;
        assert_eq!(outcome.status, TestStatus::Passed);
    }

    #[tokio::test]
    async fn test_unregistered_unit_fails() {
        let unit = TestCaseUnit::new(99, "99", InputBag::new(), None);
        let outcome = outcome(unit).await;
        assert_eq!(outcome.status, TestStatus::Failed);
        assert_eq!(outcome.summary, "no test case registered for id 99");
    }

    #[test]
    fn test_client_name_taken_from_inputs() {
        let mut inputs = InputBag::new();
        inputs.insert("ClientName".into(), Value::String("client01".into()));
        let ctx = TestContext::new(1, "t", inputs, Arc::new(TestSetInfo::default()), None);
        assert_eq!(ctx.client_name(), Some("client01"));
        assert_eq!(ctx.input_str("ClientName"), Some("client01"));
    }

    #[test]
    fn test_status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&TestStatus::NotRun).unwrap(), "\"NOT_RUN\"");
        assert_eq!(TestStatus::Passed.to_string(), "PASSED");
    }
}
