//! Test cases implemented by external commands.
//!
//! The command runs through the harness shell with:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `CV_TC_ID` | numeric test case id |
//! | `CV_TC_INPUTS` | the manifest inputs as a JSON object |
//! | `CV_TESTSET` | name of the enclosing testset |
//! | `CV_COMMSERV` | CommServ name, when a session exists |
//!
//! Exit status 0 is a pass; anything else is a failure whose reason is the
//! last stderr line. If the last JSON line on stdout is an object, its
//! `client_name`, `url` and `attachments` fields are applied to the result.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{TestCase, TestContext};
use crate::config::CommandTestCaseConfig;
use crate::shell::{CommandOutput, ShellCommand};

#[derive(Debug, Default, Deserialize)]
struct CommandReport {
    client_name: Option<String>,
    url: Option<String>,
    #[serde(default)]
    attachments: Vec<PathBuf>,
}

pub struct CommandTestCase {
    config: Arc<CommandTestCaseConfig>,
    shell: String,
}

impl CommandTestCase {
    pub fn new(config: Arc<CommandTestCaseConfig>, shell: impl Into<String>) -> Self {
        Self {
            config,
            shell: shell.into(),
        }
    }

    fn command(&self, ctx: &TestContext, command: &str) -> anyhow::Result<ShellCommand> {
        let inputs = serde_json::to_string(ctx.inputs()).context("Failed to encode inputs")?;
        let mut cmd = ShellCommand::new(self.shell.clone(), command)
            .with_working_dir(self.config.working_dir.clone())
            .with_envs(self.config.env.clone())
            .with_env("CV_TC_ID", ctx.id().to_string())
            .with_env("CV_TC_INPUTS", inputs)
            .with_env("CV_TESTSET", ctx.testset().name.clone());
        if let Some(session) = ctx.session() {
            cmd = cmd.with_env("CV_COMMSERV", session.commserv_name());
        }
        Ok(cmd)
    }
}

fn log_output(output: &CommandOutput) {
    for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
        info!("{}", line);
    }
    for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
        debug!("stderr: {}", line);
    }
}

#[async_trait]
impl TestCase for CommandTestCase {
    async fn run(&mut self, ctx: &mut TestContext) -> anyhow::Result<()> {
        let output = self
            .command(ctx, &self.config.command)?
            .run()
            .await
            .with_context(|| format!("Failed to run test case command for {}", ctx.id()))?;
        log_output(&output);

        if let Some(report) = output.last_json_line::<CommandReport>() {
            if let Some(client) = report.client_name {
                ctx.set_client_name(client);
            }
            if let Some(url) = report.url {
                ctx.set_url(url);
            }
            for path in report.attachments {
                ctx.attach(path);
            }
        }

        if output.success() {
            ctx.pass();
        } else {
            let reason = output
                .last_stderr_line()
                .map(str::to_string)
                .unwrap_or_else(|| format!("exited with status {}", output.exit_code));
            ctx.fail(reason);
        }
        Ok(())
    }

    async fn tear_down(&mut self, ctx: &TestContext) -> anyhow::Result<()> {
        let Some(command) = self.config.tear_down.as_deref() else {
            return Ok(());
        };
        let output = self.command(ctx, command)?.run().await?;
        log_output(&output);
        if !output.success() {
            bail!("tear_down command exited with status {}", output.exit_code);
        }
        Ok(())
    }
}
