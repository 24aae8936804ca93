//! Report mail composition and delivery.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::ReportError;
use crate::config::EmailConfig;
use crate::manifest::EmailInput;
use crate::orchestrator::{NO_CLIENT, RunOutcome};
use crate::shell::{ShellCommand, render_template_with_raw};

/// A composed report mail.
#[derive(Debug, Clone, PartialEq)]
pub struct Mail {
    pub subject: String,
    pub receivers: Vec<String>,
    pub body_html: String,
    pub attachments: Vec<PathBuf>,
}

/// Delivers report mails.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<(), ReportError>;
}

/// Builds the report mail for a run.
///
/// Returns `None` when nobody would receive it. `testset_names` are the
/// subject names of the testsets that ran, in run order.
pub fn compose_mail(
    input: &EmailInput,
    config: &EmailConfig,
    outcome: &RunOutcome,
    testset_names: &[String],
    body_html: String,
) -> Option<Mail> {
    let failed = outcome.exit_code() != 0;

    let mut receivers = Vec::new();
    add_receivers(&mut receivers, input.receiver.as_deref().unwrap_or(""));
    add_receivers(&mut receivers, &config.extra_receivers);
    if failed {
        match &input.notify_fail_only {
            None | Some(Value::Null) => {}
            Some(Value::Array(list)) => {
                for receiver in list.iter().filter_map(Value::as_str) {
                    add_receivers(&mut receivers, receiver);
                }
            }
            Some(other) => warn!(
                "notifyFailOnly must be a list of receivers, ignoring {}",
                other
            ),
        }
    }

    if receivers.is_empty() {
        info!("No mail receivers configured; not sending the report");
        return None;
    }

    let explicit = input.subject.as_deref().filter(|s| !s.trim().is_empty());
    let mut subject = match explicit {
        Some(subject) => subject.to_string(),
        None => {
            let names: Vec<&str> = testset_names
                .iter()
                .map(String::as_str)
                .filter(|n| !n.is_empty())
                .collect();
            format!("{}[{}]", config.subject_prefix, names.join(", "))
        }
    };
    subject.insert_str(0, if failed { "[FAILED] " } else { "[SUCCESS] " });

    if explicit.is_none() && config.include_clients_in_subject {
        let clients: Vec<&str> = unique(
            outcome
                .records
                .values()
                .flatten()
                .map(|r| r.client_name.trim())
                .filter(|c| !c.is_empty() && *c != NO_CLIENT.trim()),
        );
        if !clients.is_empty() {
            subject.push_str(&format!(" [{}]", clients.join(", ")));
        }
    }

    let attachments: Vec<PathBuf> = unique(
        outcome
            .records
            .values()
            .flatten()
            .flat_map(|r| r.attachments.iter().cloned()),
    );

    Some(Mail {
        subject,
        receivers,
        body_html,
        attachments,
    })
}

fn add_receivers(receivers: &mut Vec<String>, list: &str) {
    for receiver in list.split([';', ',']).map(str::trim).filter(|r| !r.is_empty()) {
        if !receivers.iter().any(|r| r.eq_ignore_ascii_case(receiver)) {
            receivers.push(receiver.to_string());
        }
    }
}

fn unique<T: PartialEq>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut out = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Sends mail by piping the HTML body into a configured command.
///
/// `{subject}` and `{receivers}` (comma-separated) are substituted as
/// single shell words; `{attachments}` expands to one quoted word per file.
/// Without a command, mails are logged and dropped.
pub struct SendmailNotifier {
    command: Option<String>,
    shell: String,
    timeout: Duration,
}

impl SendmailNotifier {
    pub fn new(command: Option<String>, shell: impl Into<String>) -> Self {
        Self {
            command,
            shell: shell.into(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn render(&self, template: &str, mail: &Mail) -> String {
        let attachments = mail
            .attachments
            .iter()
            .map(|p| shell_words::quote(&p.to_string_lossy()).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let receivers = mail.receivers.join(",");
        render_template_with_raw(
            template,
            &[("subject", mail.subject.as_str()), ("receivers", receivers.as_str())],
            &[("attachments", attachments.as_str())],
        )
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn send(&self, mail: &Mail) -> Result<(), ReportError> {
        let Some(template) = self.command.as_deref() else {
            info!(
                "No mail command configured; skipping mail \"{}\" to {}",
                mail.subject,
                mail.receivers.join(", ")
            );
            return Ok(());
        };

        let output = ShellCommand::new(self.shell.clone(), self.render(template, mail))
            .with_env("CV_MAIL_SUBJECT", mail.subject.clone())
            .with_env("CV_MAIL_RECEIVERS", mail.receivers.join(","))
            .with_stdin(mail.body_html.clone())
            .with_timeout(self.timeout)
            .run()
            .await
            .map_err(|e| ReportError::Mail(e.to_string()))?;

        if !output.success() {
            return Err(ReportError::Mail(
                output
                    .last_stderr_line()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("mail command exited with status {}", output.exit_code)),
            ));
        }
        info!("Sent report mail to {}", mail.receivers.join(", "));
        Ok(())
    }
}
