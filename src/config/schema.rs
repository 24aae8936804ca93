//! Configuration schema definitions for cvrun.
//!
//! This module defines all configuration types that can be deserialized from
//! the TOML harness configuration. Every section is optional; omitted values
//! take the defaults listed on each type.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── HarnessConfig          - Worker counts, log directory, shell
//! ├── ReportConfig           - Where the HTML report is written
//! ├── ConnectorConfig        - Commands used to log in / upload results (optional)
//! ├── EmailConfig            - Mail command and receiver/subject policy
//! └── testcases              - Command-backed test case registrations by id
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for cvrun.
///
/// # TOML Structure
///
/// ```toml
/// [harness]
/// testset_threads = 2
/// testcase_threads = 4
/// log_dir = "~/automation/logs"
///
/// [report]
/// output_dir = "automation-results"
///
/// [connector]
/// login_command = "cvlogin --host {host} --user {username}"
/// update_results_command = "cvupdate --host {host}"
///
/// [email]
/// command = "mail-html --subject {subject} --to {receivers} {attachments}"
/// extra_receivers = "qa-leads@example.com"
///
/// [testcases.70840]
/// name = "Backup filter validation"
/// product = "KUBERNETES"
/// os = "LINUX"
/// command = "./testcases/70840.sh"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Process-wide execution defaults.
    pub harness: HarnessConfig,

    /// Report artifact settings.
    pub report: ReportConfig,

    /// How to reach the commcell. Without it, manifests that request a
    /// connection fail at login.
    pub connector: Option<ConnectorConfig>,

    /// Mail delivery settings.
    pub email: EmailConfig,

    /// Command-backed test cases keyed by numeric test case id.
    pub testcases: BTreeMap<String, CommandTestCaseConfig>,
}

/// Core harness settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `testset_threads` | 1 |
/// | `testcase_threads` | 1 |
/// | `log_dir` | `logs` |
/// | `shell` | `/bin/sh` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Number of testset workers when the manifest does not set
    /// `testsetConfig.THREADS`.
    #[serde(default = "default_threads")]
    pub testset_threads: usize,

    /// Number of testcase workers per testset when the testset does not set
    /// a positive `THREADS`.
    #[serde(default = "default_threads")]
    pub testcase_threads: usize,

    /// Directory receiving `Automation.log`. `~` is expanded.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Shell used for every configured command, invoked as `{shell} -c "{command}"`.
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl HarnessConfig {
    /// Returns the log directory with a leading `~` expanded.
    pub fn log_dir(&self) -> PathBuf {
        let raw = self.log_dir.to_string_lossy();
        PathBuf::from(shellexpand::tilde(&raw).into_owned())
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            testset_threads: default_threads(),
            testcase_threads: default_threads(),
            log_dir: default_log_dir(),
            shell: default_shell(),
        }
    }
}

fn default_threads() -> usize {
    1
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Report artifact settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory the HTML report is written into. Created if missing.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// File name of the HTML report inside `output_dir`.
    #[serde(default = "default_html_file")]
    pub html_file: String,
}

impl ReportConfig {
    /// Full path of the HTML report.
    pub fn html_path(&self) -> PathBuf {
        self.output_dir.join(&self.html_file)
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            html_file: default_html_file(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("automation-results")
}

fn default_html_file() -> String {
    "report.html".to_string()
}

/// Commands used to talk to the commcell.
///
/// Every command is a template run through the harness shell. The login
/// command receives `{host}` and `{username}`; the password is passed in the
/// `CV_COMMCELL_PASSWORD` environment variable so it never shows up in a
/// process listing. It must print a JSON line such as
/// `{"commserv_name": "cs01", "version": "11.32.4"}`.
///
/// The update command receives the results payload as JSON on stdin and
/// prints `{"errorCode": 0, "errorMessage": ""}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectorConfig {
    /// Login command template.
    pub login_command: String,

    /// Results upload command template (`{host}`, `{job_id}`).
    pub update_results_command: Option<String>,

    /// Logout command template (`{host}`).
    pub logout_command: Option<String>,

    /// Working directory for connector commands.
    pub working_dir: Option<PathBuf>,

    /// Timeout applied to every connector command.
    ///
    /// Default: 300
    #[serde(default = "default_connector_timeout")]
    pub timeout_secs: u64,
}

fn default_connector_timeout() -> u64 {
    300
}

/// Mail delivery settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailConfig {
    /// Mail command template. The HTML body is written to its stdin;
    /// `{subject}`, `{receivers}` and `{attachments}` are substituted.
    /// Without a command, mail is logged and skipped.
    pub command: Option<String>,

    /// Receivers appended to every manifest's receiver list (`;`-separated).
    #[serde(default)]
    pub extra_receivers: String,

    /// Append the tested client names to a generated subject line.
    #[serde(default = "default_true")]
    pub include_clients_in_subject: bool,

    /// Prefix of generated subject lines.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            command: None,
            extra_receivers: String::new(),
            include_clients_in_subject: true,
            subject_prefix: default_subject_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_subject_prefix() -> String {
    "ContentStore Automation Report ".to_string()
}

/// A test case implemented by an external command.
///
/// # Example
///
/// ```toml
/// [testcases.58123]
/// name = "Incremental backup and restore"
/// product = "FILESYSTEM"
/// os = "UNIX"
/// command = "python3 testcases/58123.py"
/// tear_down = "python3 testcases/58123.py --cleanup"
///
/// [testcases.58123.env]
/// PYTHONUNBUFFERED = "1"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandTestCaseConfig {
    /// Display name.
    pub name: String,

    /// Product the test case belongs to, used to group converted manifests.
    #[serde(default)]
    pub product: String,

    /// Operating system the test case targets.
    #[serde(default)]
    pub os: String,

    /// Command executing the test case body.
    pub command: String,

    /// Optional cleanup command run after the body.
    pub tear_down: Option<String>,

    /// Working directory for both commands.
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.harness.testset_threads, 1);
        assert_eq!(config.harness.testcase_threads, 1);
        assert_eq!(config.harness.shell, "/bin/sh");
        assert_eq!(
            config.report.html_path(),
            PathBuf::from("automation-results/report.html")
        );
        assert!(config.email.include_clients_in_subject);
        assert!(config.testcases.is_empty());
    }

    #[test]
    fn test_full_document() {
        let config: Config = toml::from_str(
            r#"
            [harness]
            testset_threads = 3
            testcase_threads = 5

            [connector]
            login_command = "cvlogin --host {host}"
            timeout_secs = 10

            [email]
            command = "sendmail -t"
            extra_receivers = "lead@example.com"
            include_clients_in_subject = false

            [testcases.1234]
            name = "Smoke"
            product = "FS"
            os = "UNIX"
            command = "true"
            "#,
        )
        .unwrap();

        assert_eq!(config.harness.testset_threads, 3);
        assert_eq!(config.harness.testcase_threads, 5);
        let connector = config.connector.unwrap();
        assert_eq!(connector.timeout_secs, 10);
        assert!(connector.update_results_command.is_none());
        assert_eq!(config.email.extra_receivers, "lead@example.com");
        assert!(!config.email.include_clients_in_subject);
        assert_eq!(config.testcases["1234"].product, "FS");
    }

    #[test]
    fn test_log_dir_expands_tilde() {
        let harness = HarnessConfig {
            log_dir: PathBuf::from("~/logs"),
            ..Default::default()
        };
        if std::env::var_os("HOME").is_some() {
            assert!(!harness.log_dir().to_string_lossy().starts_with('~'));
        }
        assert!(harness.log_dir().ends_with("logs"));
    }
}
