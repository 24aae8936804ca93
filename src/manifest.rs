//! Run manifest parsing.
//!
//! A run is described by a JSON document (the manifest). Only the keys the
//! harness inspects are modelled; everything else is kept verbatim in
//! `extra` maps so a converted manifest round-trips unknown keys.
//!
//! ```json
//! {
//!   "jobID": 4213,
//!   "commcell": {
//!     "webconsoleHostname": "cs01.example.com",
//!     "commcellUsername": "admin",
//!     "commcellPassword": "..."
//!   },
//!   "email": { "receiver": "qa@example.com", "notifyFailOnly": ["dev@example.com"] },
//!   "testsetConfig": { "THREADS": 2 },
//!   "testsets": {
//!     "FileSystem_UNIX": {
//!       "TESTSET_PRODUCT_NAME": "FileSystem",
//!       "TESTSET_OS_TYPE": "UNIX",
//!       "THREADS": 4,
//!       "testCases": { "58123": { "ClientName": "client01" }, "58124": {} }
//!     }
//!   }
//! }
//! ```
//!
//! Parsing is all-or-nothing: any schema violation is a [`ManifestError`]
//! and nothing is run.

pub mod convert;
pub mod filter;

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub use filter::RunFilter;

/// Input parameters handed to a test case.
pub type InputBag = serde_json::Map<String, Value>;

/// Values that mean "not set" for optional testset properties.
pub const IGNORE_VALUES: [&str; 4] = ["none", "na", "<notset>", "null"];

/// Errors raised while loading a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The manifest file does not exist.
    #[error("JSON file not found at: {0}")]
    NotFound(PathBuf),

    /// The manifest file exists but could not be read.
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The content is not valid JSON or does not match the schema.
    #[error("Invalid manifest: {0}")]
    Parse(#[from] serde_json::Error),

    /// Neither `testsets` nor the `testcases` shortcut is present.
    #[error("Manifest contains neither `testsets` nor `testcases`")]
    NoTestSets,

    /// A test case key is not a numeric id.
    #[error("Invalid test case id `{0}`: test case ids must be numeric")]
    InvalidTestCaseId(String),
}

/// The parsed JSON input driving a run.
///
/// Immutable once parsed; the controller only reads it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunManifest {
    /// Opaque job identifier used for logging and DB correlation.
    #[serde(rename = "jobID", default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,

    /// One endpoint or an ordered list of candidate endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commcell: Option<CommcellInput>,

    /// Mail settings for the run report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailInput>,

    /// Global testset settings.
    #[serde(
        rename = "testsetConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub testset_config: Option<TestSetConfig>,

    /// Testsets by name, in manifest order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testsets: Option<IndexMap<String, TestSetDefinition>>,

    /// Legacy shortcut: test case id → inputs, converted into testsets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testcases: Option<IndexMap<String, Option<InputBag>>>,

    /// Keys the harness does not interpret.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl RunManifest {
    /// Loads and validates a manifest from a file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Parses and validates a manifest from a JSON string.
    pub fn from_json_str(content: &str) -> Result<Self, ManifestError> {
        let manifest: RunManifest = serde_json::from_str(content)?;
        manifest.validated()
    }

    /// Parses and validates a manifest from an already decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        let manifest: RunManifest = serde_json::from_value(value)?;
        manifest.validated()
    }

    fn validated(mut self) -> Result<Self, ManifestError> {
        if self.testsets.is_none() && self.testcases.is_none() {
            return Err(ManifestError::NoTestSets);
        }

        if let Some(testcases) = &self.testcases {
            for id in testcases.keys() {
                parse_test_case_id(id)?;
            }
        }

        if let Some(testsets) = &mut self.testsets {
            for (name, definition) in testsets.iter_mut() {
                definition.name = name.clone();
            }
        }

        Ok(self)
    }

    /// Returns `true` if the manifest only carries the legacy `testcases`
    /// shortcut and has to be converted before it can run.
    pub fn needs_conversion(&self) -> bool {
        self.testsets.is_none()
    }

    /// Iterates over the testsets in manifest order.
    pub fn testsets(&self) -> impl Iterator<Item = &TestSetDefinition> {
        self.testsets.iter().flat_map(|sets| sets.values())
    }

    /// Number of testset workers requested by `testsetConfig.THREADS`.
    ///
    /// Non-positive values are treated as unset.
    pub fn testset_threads(&self) -> Option<usize> {
        self.testset_config
            .as_ref()
            .and_then(|c| c.threads)
            .filter(|n| *n > 0)
            .map(|n| n as usize)
    }

    /// Human-readable job label for log lines.
    pub fn job_label(&self) -> String {
        self.job_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "###".to_string())
    }
}

/// Loads the manifest at `path`.
///
/// # Errors
///
/// Returns [`ManifestError`] if the file is missing, is not valid JSON, or
/// does not match the manifest schema.
pub fn parse_manifest(path: &Path) -> Result<RunManifest, ManifestError> {
    RunManifest::load(path)
}

/// Parses a manifest test case key into its numeric id.
pub fn parse_test_case_id(raw: &str) -> Result<u64, ManifestError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ManifestError::InvalidTestCaseId(raw.to_string()))
}

/// The `jobID` value: numeric for DB-tracked runs, free text otherwise.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum JobId {
    Number(i64),
    Text(String),
}

impl JobId {
    /// Returns the id if it is a positive integer, the only form results
    /// are uploaded for.
    pub fn tracked(&self) -> Option<u64> {
        match self {
            JobId::Number(n) if *n > 0 => Some(*n as u64),
            _ => None,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Number(n) => write!(f, "{n}"),
            JobId::Text(s) => f.write_str(s),
        }
    }
}

/// The `commcell` node: a single endpoint or an ordered list of candidates.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CommcellInput {
    Candidates(Vec<CommcellEndpoint>),
    Single(CommcellEndpoint),
}

impl CommcellInput {
    /// Endpoints in the order they should be tried.
    pub fn endpoints(&self) -> &[CommcellEndpoint] {
        match self {
            CommcellInput::Candidates(list) => list,
            CommcellInput::Single(endpoint) => std::slice::from_ref(endpoint),
        }
    }

    /// Returns `true` for the degenerate single endpoint that carries
    /// credentials but no host: nothing can be run, only notified.
    pub fn is_notify_only(&self) -> bool {
        match self {
            CommcellInput::Single(endpoint) => {
                endpoint.hostname.is_none()
                    && endpoint.username.is_some()
                    && endpoint.password.is_some()
            }
            CommcellInput::Candidates(_) => false,
        }
    }
}

/// Connection details for one commcell web console.
#[derive(Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CommcellEndpoint {
    #[serde(
        rename = "webconsoleHostname",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hostname: Option<String>,

    #[serde(
        rename = "commcellUsername",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username: Option<String>,

    #[serde(
        rename = "commcellPassword",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<String>,

    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl CommcellEndpoint {
    /// Host name for log lines.
    pub fn display_host(&self) -> &str {
        self.hostname.as_deref().unwrap_or("<unset>")
    }
}

impl fmt::Debug for CommcellEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommcellEndpoint")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The `email` node.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EmailInput {
    /// `;`-separated receivers.
    #[serde(default)]
    pub receiver: Option<String>,

    /// Explicit subject; a subject is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Receivers added only when something failed. Must be an array.
    #[serde(
        rename = "notifyFailOnly",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub notify_fail_only: Option<Value>,

    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

/// The `testsetConfig` node.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TestSetConfig {
    #[serde(
        rename = "THREADS",
        default,
        deserialize_with = "de::thread_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub threads: Option<i64>,

    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

/// One testset as described in the manifest.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TestSetDefinition {
    /// The testset's key in the `testsets` map.
    #[serde(skip)]
    pub name: String,

    #[serde(
        rename = "TESTSET_PRODUCT_NAME",
        default,
        deserialize_with = "de::opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub product: Option<String>,

    #[serde(
        rename = "TESTSET_OS_TYPE",
        default,
        deserialize_with = "de::opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub os_type: Option<String>,

    #[serde(
        rename = "TESTSET_APPLICATION_VERSION",
        default,
        deserialize_with = "de::opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub application_version: Option<String>,

    #[serde(
        rename = "TESTSET_ADDITIONAL_PROP",
        default,
        deserialize_with = "de::opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_prop: Option<String>,

    /// Testcase worker count for this testset.
    #[serde(
        rename = "THREADS",
        default,
        deserialize_with = "de::thread_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub threads: Option<i64>,

    /// Test cases in manifest order.
    #[serde(rename = "testCases", default)]
    pub test_cases: TestCaseEntries,

    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl TestSetDefinition {
    pub fn product(&self) -> &str {
        self.product.as_deref().unwrap_or("")
    }

    pub fn os_type(&self) -> &str {
        self.os_type.as_deref().unwrap_or("")
    }

    /// Application version, or empty when unset or a placeholder value.
    pub fn application_version(&self) -> &str {
        meaningful(self.application_version.as_deref())
    }

    /// Additional property, or empty when unset or a placeholder value.
    pub fn additional_prop(&self) -> &str {
        meaningful(self.additional_prop.as_deref())
    }

    /// Name used in generated mail subjects:
    /// `product_os_addprop_appver` with empty parts dropped.
    pub fn subject_name(&self) -> String {
        let mut name = self.product().to_string();
        for part in [
            self.os_type(),
            self.additional_prop.as_deref().unwrap_or(""),
            self.application_version.as_deref().unwrap_or(""),
        ] {
            if !part.is_empty() {
                name.push('_');
                name.push_str(part);
            }
        }
        name
    }
}

fn meaningful(value: Option<&str>) -> &str {
    match value {
        Some(v) if !IGNORE_VALUES.contains(&v.to_lowercase().as_str()) => v,
        _ => "",
    }
}

/// One test case reference inside a testset.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCaseEntry {
    pub id: u64,
    pub inputs: InputBag,
}

impl TestCaseEntry {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            inputs: InputBag::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: InputBag) -> Self {
        self.inputs = inputs;
        self
    }
}

/// Ordered test case entries of a testset.
///
/// Accepts either an object (`{"58123": {...inputs}}`) or an array of ids
/// (`[58123, "58124"]`); always serialises as an object.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "RawTestCases", into = "RawTestCases")]
pub struct TestCaseEntries(Vec<TestCaseEntry>);

impl TestCaseEntries {
    pub fn new(entries: Vec<TestCaseEntry>) -> Self {
        Self(entries)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TestCaseEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, entry: TestCaseEntry) {
        self.0.push(entry);
    }
}

impl<'a> IntoIterator for &'a TestCaseEntries {
    type Item = &'a TestCaseEntry;
    type IntoIter = std::slice::Iter<'a, TestCaseEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum RawTestCases {
    Map(IndexMap<String, Option<InputBag>>),
    List(Vec<RawTestCaseId>),
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum RawTestCaseId {
    Number(u64),
    Text(String),
}

impl TryFrom<RawTestCases> for TestCaseEntries {
    type Error = ManifestError;

    fn try_from(raw: RawTestCases) -> Result<Self, Self::Error> {
        let entries = match raw {
            RawTestCases::Map(map) => map
                .into_iter()
                .map(|(id, inputs)| {
                    Ok(TestCaseEntry::new(parse_test_case_id(&id)?)
                        .with_inputs(inputs.unwrap_or_default()))
                })
                .collect::<Result<Vec<_>, ManifestError>>()?,
            RawTestCases::List(ids) => ids
                .into_iter()
                .map(|id| match id {
                    RawTestCaseId::Number(n) => Ok(TestCaseEntry::new(n)),
                    RawTestCaseId::Text(s) => Ok(TestCaseEntry::new(parse_test_case_id(&s)?)),
                })
                .collect::<Result<Vec<_>, ManifestError>>()?,
        };
        Ok(Self(entries))
    }
}

impl From<TestCaseEntries> for RawTestCases {
    fn from(entries: TestCaseEntries) -> Self {
        RawTestCases::Map(
            entries
                .0
                .into_iter()
                .map(|entry| (entry.id.to_string(), Some(entry.inputs)))
                .collect(),
        )
    }
}

/// Lenient field deserializers for values that arrive as numbers or strings.
mod de {
    use super::*;

    /// `THREADS` may be written as `2` or `"2"`.
    pub(super) fn thread_count<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid THREADS value {n}"))),
            Some(Value::String(s)) => s.trim().parse::<i64>().map(Some).map_err(|_| {
                serde::de::Error::custom(format!("invalid THREADS value `{s}`"))
            }),
            Some(other) => Err(serde::de::Error::custom(format!(
                "invalid THREADS value {other}"
            ))),
        }
    }

    /// Text properties occasionally arrive as numbers (`2019`).
    pub(super) fn opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(serde::de::Error::custom(format!(
                "expected text, found {other}"
            ))),
        }
    }
}
