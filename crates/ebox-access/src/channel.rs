//! Unprivileged file source and the secondary privileged channel.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Unprivileged file reads.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Reads a file, returning its trimmed content or `None`.
    async fn read(&self, path: &Path) -> Option<String>;
}

/// Reads straight from the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSource;

#[async_trait]
impl FileSource for FsSource {
    async fn read(&self, path: &Path) -> Option<String> {
        let content = tokio::fs::read_to_string(path).await.ok()?;
        non_empty(content)
    }
}

/// A privileged channel other than the root shell.
///
/// Authorization can be revoked externally at any time, so callers must ask
/// `is_authorized` live instead of caching the answer.
#[async_trait]
pub trait SecondaryChannel: Send + Sync {
    /// Provider label for display.
    fn provider(&self) -> &str;

    /// Returns true when the channel is reachable and authorized right now.
    async fn is_authorized(&self) -> bool;

    /// Runs a shell command through the channel.
    async fn run(&self, command: &str) -> Option<String>;
}

/// Secondary channel backed by an external command prefix.
///
/// `run` executes `<prefix...> <command>`; authorization runs the `ping`
/// command line and requires a zero exit status.
pub struct CommandChannel {
    provider: String,
    prefix: Vec<String>,
    ping: Vec<String>,
    timeout: Duration,
}

impl CommandChannel {
    /// Creates a channel. The provider label is taken from the prefix program.
    pub fn new(prefix: Vec<String>, ping: Vec<String>, timeout: Duration) -> Self {
        let provider = prefix
            .first()
            .and_then(|p| Path::new(p).file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "secondary".to_string());
        Self {
            provider,
            prefix,
            ping,
            timeout,
        }
    }

    async fn output(&self, argv: &[String]) -> Option<(bool, String)> {
        let (program, args) = argv.split_first()?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(out)) => Some((
                out.status.success(),
                String::from_utf8_lossy(&out.stdout).to_string(),
            )),
            Ok(Err(e)) => {
                debug!("Secondary channel {} failed: {}", self.provider, e);
                None
            }
            Err(_) => {
                debug!("Secondary channel {} timed out", self.provider);
                None
            }
        }
    }
}

#[async_trait]
impl SecondaryChannel for CommandChannel {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn is_authorized(&self) -> bool {
        if self.ping.is_empty() {
            return false;
        }
        matches!(self.output(&self.ping).await, Some((true, _)))
    }

    async fn run(&self, command: &str) -> Option<String> {
        let mut argv = self.prefix.clone();
        argv.push(command.to_string());
        let (_, stdout) = self.output(&argv).await?;
        non_empty(stdout)
    }
}

/// Runs a command unprivileged through `sh -c`.
pub(crate) async fn run_unprivileged(command: &str, timeout: Duration) -> Option<String> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    let out = tokio::time::timeout(timeout, child).await.ok()?.ok()?;
    non_empty(String::from_utf8_lossy(&out.stdout).to_string())
}

pub(crate) fn non_empty(content: String) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Quotes a path for inclusion in a shell command.
pub(crate) fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}
