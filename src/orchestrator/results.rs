//! Shared result collection for a run.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};

use crate::testcase::{TestOutcome, TestSetInfo, TestStatus};

/// Timestamp format used in records, reports and the results upload.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Client name recorded when neither the test case nor the session names one.
pub const NO_CLIENT: &str = " -- ";

fn format_time<S: Serializer>(time: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&time.format(TIME_FORMAT))
}

/// One finished test case as recorded in the aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct TestCaseRecord {
    #[serde(rename = "Test Case ID")]
    pub id: u64,

    #[serde(rename = "Test Case Name")]
    pub name: String,

    #[serde(rename = "Client Name")]
    pub client_name: String,

    #[serde(rename = "URL", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(rename = "Status")]
    pub status: TestStatus,

    #[serde(rename = "Summary")]
    pub summary: String,

    #[serde(rename = "Start Time", serialize_with = "format_time")]
    pub started: DateTime<Local>,

    #[serde(rename = "End Time", serialize_with = "format_time")]
    pub finished: DateTime<Local>,

    #[serde(rename = "Attachments")]
    pub attachments: Vec<PathBuf>,
}

impl TestCaseRecord {
    /// Builds the record for an outcome; the client falls back to the
    /// CommServ name, then to a placeholder.
    pub fn from_outcome(outcome: TestOutcome, commserv_name: Option<&str>) -> Self {
        let client_name = outcome
            .client_name
            .or_else(|| commserv_name.map(str::to_string))
            .unwrap_or_else(|| NO_CLIENT.to_string());
        Self {
            id: outcome.id,
            name: outcome.name,
            client_name,
            url: outcome.url,
            status: outcome.status,
            summary: outcome.summary,
            started: outcome.started,
            finished: outcome.finished,
            attachments: outcome.attachments,
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished - self.started
    }
}

/// A run-level operation that failed outside any test case.
#[derive(Debug, Clone, Serialize)]
pub struct OperationFailure {
    #[serde(rename = "Operation")]
    pub operation: String,

    #[serde(rename = "Status")]
    pub status: TestStatus,

    #[serde(rename = "Reason")]
    pub reason: String,
}

impl OperationFailure {
    pub fn new(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status: TestStatus::Failed,
            reason: reason.into(),
        }
    }
}

/// Per-testset summary handed to console output and the results upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSetSummary {
    pub testset_name: String,
    pub feature_name: String,
    pub os_name: String,
    pub app_version_name: String,
    pub add_prop_name: String,
    pub testcases: Vec<TestCaseRecord>,
}

impl TestSetSummary {
    pub fn new(info: &TestSetInfo, testcases: Vec<TestCaseRecord>) -> Self {
        Self {
            testset_name: info.name.clone(),
            feature_name: info.product.clone(),
            os_name: info.os_type.clone(),
            app_version_name: info.application_version.clone(),
            add_prop_name: info.additional_prop.clone(),
            testcases,
        }
    }
}

/// Passed/failed counts over a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl Counts {
    pub fn of<'a>(records: impl IntoIterator<Item = &'a TestCaseRecord>) -> Self {
        records.into_iter().fold(Self::default(), |mut c, r| {
            c.total += 1;
            match r.status {
                TestStatus::Passed => c.passed += 1,
                TestStatus::Failed => c.failed += 1,
                TestStatus::NotRun => {}
            }
            c
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Results of a run, shared by every worker.
///
/// Records and testset summaries sit behind separate locks. Neither lock is
/// held across an `.await`.
#[derive(Debug, Default)]
pub struct ResultsAggregate {
    records: Mutex<IndexMap<String, Vec<TestCaseRecord>>>,
    summaries: Mutex<Vec<TestSetSummary>>,
    operations: Mutex<Vec<OperationFailure>>,
}

impl ResultsAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the testset's slot so report order follows start order.
    pub fn register_testset(&self, testset: &str) {
        lock(&self.records).entry(testset.to_string()).or_default();
    }

    pub fn append(&self, testset: &str, record: TestCaseRecord) {
        lock(&self.records)
            .entry(testset.to_string())
            .or_default()
            .push(record);
    }

    pub fn records_for(&self, testset: &str) -> Vec<TestCaseRecord> {
        lock(&self.records).get(testset).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> IndexMap<String, Vec<TestCaseRecord>> {
        lock(&self.records).clone()
    }

    pub fn push_summary(&self, summary: TestSetSummary) {
        lock(&self.summaries).push(summary);
    }

    pub fn summaries(&self) -> Vec<TestSetSummary> {
        lock(&self.summaries).clone()
    }

    pub fn record_operation_failure(&self, failure: OperationFailure) {
        lock(&self.operations).push(failure);
    }

    pub fn operation_failures(&self) -> Vec<OperationFailure> {
        lock(&self.operations).clone()
    }
}
