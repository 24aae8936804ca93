//! Commcell connection layer.
//!
//! A [`Connector`] logs in to one commcell endpoint and yields a
//! [`Session`]: the shared, read-only handle every test case of the run
//! receives. The session also uploads the run results to the automation
//! database at the end of the run.
//!
//! The shipped implementation is [`ScriptConnector`], which runs
//! configured shell commands and reads their JSON replies:
//!
//! ```text
//! login_command           → {"commserv_name": "cs01", "version": "11.32.4"}
//! update_results_command  → {"errorCode": 0, "errorMessage": ""}
//! ```

pub mod script;

pub use script::ScriptConnector;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::manifest::{CommcellEndpoint, CommcellInput};
use crate::orchestrator::TestSetSummary;

/// Errors raised while connecting to a commcell.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Commcell password is not set in input request")]
    MissingPassword,

    #[error("Commcell hostname is not set in input request")]
    MissingHost,

    #[error("No connector is configured")]
    NotConfigured,

    #[error("Failed to login to {host}: {reason}")]
    Login { host: String, reason: String },

    #[error("None of the webconsoles passed could be connected to: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

/// Errors raised while uploading run results.
#[derive(Debug, thiserror::Error)]
pub enum DbUpdateError {
    #[error("Failed to update automation results. Error: {message} (code {code})")]
    Rejected { code: i64, message: String },

    #[error("Failed to update automation results: {0}")]
    Transport(String),

    #[error("Results upload is not configured")]
    NotConfigured,
}

/// Logs in to commcell endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Logs in to one endpoint.
    async fn login(&self, endpoint: &CommcellEndpoint)
    -> Result<Arc<dyn Session>, ConnectionError>;

    /// Connector name (for logging).
    fn name(&self) -> &str;
}

/// An authenticated commcell session shared by every test case of a run.
#[async_trait]
pub trait Session: Send + Sync {
    /// Name of the CommServ the session is connected to.
    fn commserv_name(&self) -> &str;

    /// Dotted CommServ version, e.g. `11.32.4`.
    fn version(&self) -> &str;

    /// Uploads the run results to the automation database.
    async fn update_results(&self, payload: &DbPayload) -> Result<(), DbUpdateError>;

    async fn logout(&self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// Body of the `Automation/UpdateResults` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPayload {
    pub job_id: u64,
    pub start_time: String,
    pub end_time: String,
    pub service_pack: String,
    pub testset: Vec<TestSetSummary>,
}

/// Tries each endpoint in order and returns the first session that logs in.
///
/// Later endpoints are never contacted once one succeeds. An endpoint
/// without a password or hostname fails without calling the connector.
pub async fn establish_connection<C: Connector + ?Sized>(
    connector: &C,
    input: &CommcellInput,
) -> Result<Arc<dyn Session>, ConnectionError> {
    let endpoints = input.endpoints();
    let mut failures = Vec::with_capacity(endpoints.len());
    info!("Using connector: {}", connector.name());

    for endpoint in endpoints {
        info!("WebConsole Hostname: {}", endpoint.display_host());
        if let Some(user) = &endpoint.username {
            info!("Commcell Username: {}", user);
        }

        let attempt = if endpoint.password.is_none() {
            Err(ConnectionError::MissingPassword)
        } else if endpoint.hostname.is_none() {
            Err(ConnectionError::MissingHost)
        } else {
            connector.login(endpoint).await
        };

        match attempt {
            Ok(session) => {
                info!(
                    "Logged in to the Commcell {} successfully (CommServ {})",
                    endpoint.display_host(),
                    session.commserv_name()
                );
                return Ok(session);
            }
            Err(e) => {
                warn!("Failed to login to {}: {}", endpoint.display_host(), e);
                failures.push((endpoint.display_host().to_string(), e));
            }
        }
    }

    // A single endpoint reports its own error rather than the summary.
    if failures.len() == 1 {
        if let Some((host, e)) = failures.pop() {
            return Err(match e {
                login @ ConnectionError::Login { .. } => login,
                other => ConnectionError::Login {
                    host,
                    reason: other.to_string(),
                },
            });
        }
    }
    Err(ConnectionError::Exhausted(
        failures
            .into_iter()
            .map(|(host, e)| format!("{host}: {e}"))
            .collect(),
    ))
}

/// `11.32.4` → `v11 B80 SP32`.
pub fn version_label(version: &str) -> Option<String> {
    let mut parts = version.split('.');
    let major = parts.next().filter(|p| !p.is_empty())?;
    let sp = parts.next()?;
    Some(format!("v{major} B80 SP{sp}"))
}

/// `11.32.4` → `SP32.4`.
pub fn service_pack(version: &str) -> Option<String> {
    let mut parts = version.split('.').skip(1);
    let sp = parts.next()?;
    let hotfix = parts.next()?;
    Some(format!("SP{sp}.{hotfix}"))
}
