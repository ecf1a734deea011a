//! Persistent privileged shell session.
//!
//! One long-lived interactive child process carries every privileged command.
//! The pipe gives no message boundaries, so each command is followed by an
//! `echo` of a unique sentinel and output is read line by line until that
//! sentinel shows up. The sentinel line also carries the exit status.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Text echoed back by a freshly spawned shell.
const READY_TOKEN: &str = "ebox_ready";

/// Grace period for `exit` before the child is killed.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Output of one shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// Combined stdout/stderr, trimmed.
    pub output: String,
    /// Exit status reported by the shell, -1 if it could not be parsed.
    pub status: i32,
}

impl ShellOutput {
    /// Returns true when the command exited with status 0.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// A spawned shell with its pipes.
struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Process {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Persistent privileged shell.
///
/// Commands are serialized through an async mutex: the process has a single
/// request/response channel, so at most one command is in flight.
pub struct ShellSession {
    command: Vec<String>,
    timeout: Duration,
    process: Mutex<Option<Process>>,
    alive: AtomicBool,
    pid: AtomicU32,
    spawns: AtomicU64,
    sequence: AtomicU64,
}

impl ShellSession {
    /// Creates an unopened session for the given command line (e.g. `["su"]`).
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            process: Mutex::new(None),
            alive: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            spawns: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    /// Returns the configured shell command line.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Number of times a shell process has been spawned successfully.
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// PID of the current shell process, if one is open.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Opens the session. Succeeds without side effects when already alive.
    pub async fn open(&self) -> bool {
        let mut guard = self.process.lock().await;
        if let Some(process) = guard.as_mut() {
            if process.is_running() {
                return true;
            }
            debug!("Shell process exited, respawning");
            self.mark_dead(&mut guard);
        }
        self.open_locked(&mut guard).await
    }

    /// Runs a command and returns its trimmed output, or `None` on failure.
    pub async fn exec(&self, command: &str) -> Option<String> {
        self.exec_status(command).await.map(|o| o.output)
    }

    /// Runs a command and returns its output together with the exit status.
    ///
    /// An unopened session is opened first. An opened session is used as-is;
    /// if its process died, this call fails, the session transitions back to
    /// unopened, and the next call spawns a fresh process.
    pub async fn exec_status(&self, command: &str) -> Option<ShellOutput> {
        let mut guard = self.process.lock().await;
        if guard.is_none() && !self.open_locked(&mut guard).await {
            return None;
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let process = guard.as_mut()?;
        match tokio::time::timeout(self.timeout, run_command(process, command, seq)).await {
            Ok(Ok(output)) => Some(output),
            Ok(Err(e)) => {
                warn!("Shell command failed: {}", e);
                self.mark_dead(&mut guard);
                None
            }
            Err(_) => {
                warn!("{}", Error::Timeout(self.timeout.as_millis() as u64));
                self.mark_dead(&mut guard);
                None
            }
        }
    }

    /// Non-blocking liveness probe.
    ///
    /// While a command is in flight the last known state is reported.
    pub fn is_alive(&self) -> bool {
        match self.process.try_lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(process) => {
                    let running = process.is_running();
                    self.alive.store(running, Ordering::SeqCst);
                    running
                }
                None => false,
            },
            Err(_) => self.alive.load(Ordering::SeqCst),
        }
    }

    /// Asks the shell to exit, then releases the process. Idempotent.
    pub async fn close(&self) {
        let mut guard = self.process.lock().await;
        if let Some(mut process) = guard.take() {
            let _ = process.stdin.write_all(b"exit\n").await;
            let _ = process.stdin.flush().await;
            if tokio::time::timeout(EXIT_GRACE, process.child.wait())
                .await
                .is_err()
            {
                let _ = process.child.start_kill();
            }
            info!("Privileged shell closed");
        }
        self.alive.store(false, Ordering::SeqCst);
        self.pid.store(0, Ordering::SeqCst);
    }

    async fn open_locked(&self, slot: &mut Option<Process>) -> bool {
        match self.spawn().await {
            Ok(process) => {
                *slot = Some(process);
                self.alive.store(true, Ordering::SeqCst);
                self.spawns.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(e) => {
                debug!("Privileged shell unavailable: {}", e);
                false
            }
        }
    }

    async fn spawn(&self) -> Result<Process> {
        let (program, args) = self.command.split_first().ok_or(Error::EmptyShellCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::ShellSpawn {
                program: program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(Error::ShellClosed)?;
        let stdout = child.stdout.take().ok_or(Error::ShellClosed)?;
        let mut process = Process {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let echo = format!("echo {}", READY_TOKEN);
        let reply = match tokio::time::timeout(self.timeout, run_command(&mut process, &echo, seq))
            .await
        {
            Ok(reply) => reply,
            Err(_) => Err(Error::Timeout(self.timeout.as_millis() as u64)),
        };

        match reply {
            Ok(reply) if reply.output == READY_TOKEN => {
                let pid = process.child.id().unwrap_or(0);
                self.pid.store(pid, Ordering::SeqCst);
                info!("Privileged shell opened ({}, pid {})", program, pid);
                Ok(process)
            }
            Ok(reply) => {
                let _ = process.child.start_kill();
                Err(Error::ShellValidation {
                    expected: READY_TOKEN.to_string(),
                    actual: reply.output,
                })
            }
            Err(e) => {
                let _ = process.child.start_kill();
                Err(e)
            }
        }
    }

    fn mark_dead(&self, slot: &mut Option<Process>) {
        if let Some(mut process) = slot.take() {
            let _ = process.child.start_kill();
        }
        self.alive.store(false, Ordering::SeqCst);
        self.pid.store(0, Ordering::SeqCst);
    }
}

/// Writes one framed command and reads until its sentinel.
async fn run_command(process: &mut Process, command: &str, seq: u64) -> Result<ShellOutput> {
    let sentinel = sentinel(seq);
    let payload = frame(command, &sentinel);
    process.stdin.write_all(payload.as_bytes()).await?;
    process.stdin.flush().await?;

    let mut output = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if process.stdout.read_line(&mut line).await? == 0 {
            return Err(Error::ShellClosed);
        }
        let text = line.trim_end_matches(['\n', '\r']);
        if let Some((before, status)) = split_sentinel(text, &sentinel) {
            output.push_str(before);
            return Ok(ShellOutput {
                output: output.trim().to_string(),
                status,
            });
        }
        output.push_str(text);
        output.push('\n');
    }
}

fn sentinel(seq: u64) -> String {
    format!("__EBOX_{}_{}__", std::process::id(), seq)
}

/// Groups the command so stderr is merged, then echoes the sentinel with `$?`.
fn frame(command: &str, sentinel: &str) -> String {
    format!("{{ {}\n}} 2>&1\necho \"{}:$?\"\n", command, sentinel)
}

/// Finds the sentinel in a line; returns text before it and the exit status.
///
/// Output lacking a trailing newline shares its last line with the sentinel.
fn split_sentinel<'a>(line: &'a str, sentinel: &str) -> Option<(&'a str, i32)> {
    let idx = line.find(sentinel)?;
    let status = line[idx + sentinel.len()..]
        .strip_prefix(':')
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(-1);
    Some((&line[..idx], status))
}
