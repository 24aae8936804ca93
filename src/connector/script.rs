//! Connector backed by configured shell commands.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ConnectionError, Connector, DbPayload, DbUpdateError, Session};
use crate::config::ConnectorConfig;
use crate::manifest::CommcellEndpoint;
use crate::shell::{ShellCommand, render_template};

/// Environment variable carrying the commcell password to connector commands.
pub const PASSWORD_ENV: &str = "CV_COMMCELL_PASSWORD";

#[derive(Debug, Deserialize)]
struct LoginReply {
    commserv_name: Option<String>,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct UpdateReply {
    #[serde(rename = "errorCode", default)]
    error_code: i64,
    #[serde(rename = "errorMessage", default)]
    error_message: String,
}

/// Logs in by running `login_command` and parsing its last JSON line.
///
/// Without a `[connector]` section every login fails with
/// [`ConnectionError::NotConfigured`].
pub struct ScriptConnector {
    config: Option<Arc<ConnectorConfig>>,
    shell: String,
}

impl ScriptConnector {
    pub fn new(config: Option<ConnectorConfig>, shell: impl Into<String>) -> Self {
        Self {
            config: config.map(Arc::new),
            shell: shell.into(),
        }
    }

    fn command(&self, config: &ConnectorConfig, rendered: String) -> ShellCommand {
        ShellCommand::new(self.shell.clone(), rendered)
            .with_working_dir(config.working_dir.clone())
            .with_timeout(Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl Connector for ScriptConnector {
    async fn login(
        &self,
        endpoint: &CommcellEndpoint,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let config = self.config.as_ref().ok_or(ConnectionError::NotConfigured)?;
        let host = endpoint.hostname.clone().ok_or(ConnectionError::MissingHost)?;
        let password = endpoint
            .password
            .as_deref()
            .ok_or(ConnectionError::MissingPassword)?;
        let username = endpoint.username.as_deref().unwrap_or("");

        let rendered = render_template(
            &config.login_command,
            &[("host", host.as_str()), ("username", username)],
        );
        let output = self
            .command(config, rendered)
            .with_env(PASSWORD_ENV, password)
            .run()
            .await
            .map_err(|e| ConnectionError::Login {
                host: host.clone(),
                reason: e.to_string(),
            })?;

        if !output.success() {
            let reason = output
                .last_stderr_line()
                .map(str::to_string)
                .unwrap_or_else(|| format!("login command exited with status {}", output.exit_code));
            return Err(ConnectionError::Login { host, reason });
        }

        let reply: LoginReply = output.last_json_line().ok_or_else(|| ConnectionError::Login {
            host: host.clone(),
            reason: "login command printed no JSON reply".to_string(),
        })?;
        debug!("Login reply from {}: {:?}", host, reply);

        Ok(Arc::new(ScriptSession {
            commserv_name: reply.commserv_name.unwrap_or_else(|| host.clone()),
            version: reply.version,
            host,
            config: Arc::clone(config),
            shell: self.shell.clone(),
        }))
    }

    fn name(&self) -> &str {
        "script"
    }
}

/// Session produced by [`ScriptConnector`].
pub struct ScriptSession {
    host: String,
    commserv_name: String,
    version: String,
    config: Arc<ConnectorConfig>,
    shell: String,
}

impl ScriptSession {
    fn command(&self, rendered: String) -> ShellCommand {
        ShellCommand::new(self.shell.clone(), rendered)
            .with_working_dir(self.config.working_dir.clone())
            .with_timeout(Duration::from_secs(self.config.timeout_secs))
    }
}

#[async_trait]
impl Session for ScriptSession {
    fn commserv_name(&self) -> &str {
        &self.commserv_name
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn update_results(&self, payload: &DbPayload) -> Result<(), DbUpdateError> {
        let template = self
            .config
            .update_results_command
            .as_deref()
            .ok_or(DbUpdateError::NotConfigured)?;
        let job_id = payload.job_id.to_string();
        let rendered = render_template(
            template,
            &[("host", self.host.as_str()), ("job_id", job_id.as_str())],
        );
        let body = serde_json::to_vec(payload).map_err(|e| DbUpdateError::Transport(e.to_string()))?;

        let output = self
            .command(rendered)
            .with_stdin(body)
            .run()
            .await
            .map_err(|e| DbUpdateError::Transport(e.to_string()))?;

        if !output.success() {
            return Err(DbUpdateError::Transport(
                output
                    .last_stderr_line()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("update command exited with status {}", output.exit_code)),
            ));
        }

        match output.last_json_line::<UpdateReply>() {
            Some(reply) if reply.error_code != 0 => Err(DbUpdateError::Rejected {
                code: reply.error_code,
                message: reply.error_message,
            }),
            Some(_) => Ok(()),
            None => {
                warn!("Results upload command printed no reply; assuming success");
                Ok(())
            }
        }
    }

    async fn logout(&self) -> Result<(), ConnectionError> {
        let Some(template) = self.config.logout_command.as_deref() else {
            return Ok(());
        };
        let rendered = render_template(template, &[("host", self.host.as_str())]);
        let output = self
            .command(rendered)
            .run()
            .await
            .map_err(|e| ConnectionError::Login {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
        if !output.success() {
            warn!("Logout from {} exited with status {}", self.host, output.exit_code);
        }
        Ok(())
    }
}
