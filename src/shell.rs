//! Shell command execution shared by command-backed test cases, the script
//! connector and the mail notifier.
//!
//! Every command is a template string run as `{shell} -c "{command}"`.
//! Placeholders such as `{host}` are substituted with shell-quoted values
//! before the command is spawned, so values with spaces or quotes never
//! split into extra arguments.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Errors raised while running a shell command.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write stdin of `{0}`")]
    Stdin(String),

    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("I/O error while waiting for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ShellResult<T> = std::result::Result<T, ShellError>;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `-1` when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Parses the last stdout line that looks like a JSON object.
    pub fn last_json_line<T: DeserializeOwned>(&self) -> Option<T> {
        self.stdout
            .lines()
            .rev()
            .find(|line| line.trim().starts_with('{'))
            .and_then(|line| serde_json::from_str::<T>(line.trim()).ok())
    }

    /// Last non-empty stderr line, used as a failure reason.
    pub fn last_stderr_line(&self) -> Option<&str> {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

/// Substitutes `{name}` placeholders with shell-quoted values.
///
/// Unknown placeholders are left untouched.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    render_template_with_raw(template, values, &[])
}

/// Like [`render_template`], with extra `raw` values that are inserted
/// as given. Raw values must already be shell-safe.
///
/// The template is scanned once, so placeholder text inside a substituted
/// value is never expanded.
pub fn render_template_with_raw(
    template: &str,
    values: &[(&str, &str)],
    raw: &[(&str, &str)],
) -> String {
    fn lookup<'a>(
        name: &str,
        values: &[(&str, &'a str)],
        raw: &[(&str, &'a str)],
    ) -> Option<Cow<'a, str>> {
        if let Some(&(_, value)) = values.iter().find(|(key, _)| *key == name) {
            return Some(shell_words::quote(value));
        }
        raw.iter()
            .find(|(key, _)| *key == name)
            .map(|&(_, value)| Cow::Borrowed(value))
    }

    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let substituted = after.find('}').and_then(|close| {
            let name = &after[..close];
            lookup(name, values, raw).map(|value| (value, close))
        });
        match substituted {
            Some((value, close)) => {
                rendered.push_str(&value);
                rest = &after[close + 1..];
            }
            None => {
                rendered.push('{');
                rest = after;
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

/// A shell command ready to run.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    shell: String,
    command: String,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl ShellCommand {
    pub fn new(shell: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            command: command.into(),
            working_dir: None,
            env: HashMap::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Runs the command to completion, capturing stdout and stderr.
    pub async fn run(&self) -> ShellResult<CommandOutput> {
        debug!("Running: {} -c {:?}", self.shell, self.command);

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c").arg(&self.command);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.envs(&self.env);
        cmd.kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ShellError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        if let Some(input) = &self.stdin {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| ShellError::Stdin(self.command.clone()))?;
            // A command that ignores its stdin may close it early.
            if let Err(e) = stdin.write_all(input).await {
                debug!("stdin of {:?} closed early: {}", self.command, e);
            }
            drop(stdin);
        }

        let wait = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                ShellError::Timeout {
                    command: self.command.clone(),
                    secs: limit.as_secs(),
                }
            })?,
            None => wait.await,
        }
        .map_err(|source| ShellError::Wait {
            command: self.command.clone(),
            source,
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_render_template_quotes_values() {
        let rendered = render_template(
            "login --host {host} --user {username} {missing}",
            &[("host", "cs01"), ("username", "domain user")],
        );
        assert_eq!(rendered, "login --host cs01 --user 'domain user' {missing}");
    }

    #[test]
    fn test_render_template_never_expands_substituted_values() {
        let rendered = render_template(
            "login --user {username} --host {host}",
            &[("username", "{host}"), ("host", "cs01")],
        );
        assert_eq!(rendered, "login --user '{host}' --host cs01");

        let rendered = render_template_with_raw(
            "send {attachments} {receivers}",
            &[("receivers", "qa")],
            &[("attachments", "/tmp/{receivers}.log")],
        );
        assert_eq!(rendered, "send /tmp/{receivers}.log qa");
    }

    #[test]
    fn test_render_template_keeps_stray_braces() {
        let rendered = render_template("awk '{print $1}' {host} {", &[("host", "cs01")]);
        assert_eq!(rendered, "awk '{print $1}' cs01 {");
    }

    #[test]
    fn test_last_json_line() {
        #[derive(Deserialize)]
        struct Reply {
            code: i32,
        }
        let output = CommandOutput {
            exit_code: 0,
            stdout: "noise\n{\"code\": 1}\nmore noise\n{\"code\": 7}\n".to_string(),
            stderr: String::new(),
        };
        let reply: Reply = output.last_json_line().unwrap();
        assert_eq!(reply.code, 7);
    }

    #[test]
    fn test_last_stderr_line_skips_blanks() {
        let output = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "first\nreal reason\n\n".to_string(),
        };
        assert_eq!(output.last_stderr_line(), Some("real reason"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_output_env_and_stdin() {
        let output = ShellCommand::new("/bin/sh", "echo \"$GREETING\"; cat; echo oops >&2; exit 3")
            .with_env("GREETING", "hello")
            .with_stdin("piped")
            .run()
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(output.stdout.contains("hello"));
        assert!(output.stdout.contains("piped"));
        assert_eq!(output.last_stderr_line(), Some("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out() {
        let err = ShellCommand::new("/bin/sh", "sleep 5")
            .with_timeout(Duration::from_millis(100))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Timeout { .. }));
    }
}
