//! Remote command execution
//!
//! Each command gets a fresh exec channel. Stdin is closed right after the
//! command starts (nothing here is interactive) and output is forwarded to the
//! progress log line by line while the command runs.

use std::fmt;

use tokio::time::timeout;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::progress::{LineBuffer, ProgressLog};
use crate::ssh::{ChannelEvent, ExecChannel, RemoteSession, TransportError};

/// Exit status of a remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Status reported by the remote side
    Code(u32),
    /// No status arrived within the poll window
    Missing,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    /// Numeric code for logs; `-1` when no status arrived.
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Code(code) => *code as i32,
            ExitStatus::Missing => -1,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Which remote streams reach the progress log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Forward stdout and stderr
    Combined,
    /// Forward stdout only (PTY sessions merge stderr into stdout)
    StdoutOnly,
}

/// Run `command` on a fresh channel and wait for its exit status.
pub async fn run_command(
    session: &mut dyn RemoteSession,
    command: &str,
    log: &ProgressLog,
    policy: &RetryPolicy,
) -> Result<ExitStatus, TransportError> {
    log.line(format!("Running cmd: {}", command));
    execute(session, command, false, OutputMode::Combined, log, policy).await
}

/// Run `command` on a PTY-backed channel, forwarding stdout only.
pub async fn run_pty_command(
    session: &mut dyn RemoteSession,
    command: &str,
    log: &ProgressLog,
    policy: &RetryPolicy,
) -> Result<ExitStatus, TransportError> {
    execute(session, command, true, OutputMode::StdoutOnly, log, policy).await
}

async fn execute(
    session: &mut dyn RemoteSession,
    command: &str,
    pty: bool,
    mode: OutputMode,
    log: &ProgressLog,
    policy: &RetryPolicy,
) -> Result<ExitStatus, TransportError> {
    let mut channel = session.open_exec(command, pty).await?;
    // nothing to write here
    channel.eof().await?;
    let status = wait_completion(channel.as_mut(), log, mode, policy).await;
    channel.close().await;
    debug!("[exec] '{}' finished with {}", command, status);
    Ok(status)
}

/// Forward output until the remote side is done, then collect the exit status.
///
/// The status often arrives after EOF. When it has not been seen by then,
/// poll `policy.exit_status_polls` times, `policy.exit_status_interval()`
/// apart, before reporting [`ExitStatus::Missing`].
pub async fn wait_completion(
    channel: &mut dyn ExecChannel,
    log: &ProgressLog,
    mode: OutputMode,
    policy: &RetryPolicy,
) -> ExitStatus {
    let mut stdout = LineBuffer::default();
    let mut stderr = LineBuffer::default();
    let mut status = None;

    loop {
        match channel.wait().await {
            Some(ChannelEvent::Stdout(data)) => {
                for line in stdout.push(&data) {
                    log.line(line);
                }
            }
            Some(ChannelEvent::Stderr(data)) => {
                if mode == OutputMode::Combined {
                    for line in stderr.push(&data) {
                        log.line(line);
                    }
                }
            }
            Some(ChannelEvent::ExitStatus(code)) => status = Some(code),
            Some(ChannelEvent::Eof) | Some(ChannelEvent::Close) | None => break,
        }
    }
    for rest in [stdout.finish(), stderr.finish()].into_iter().flatten() {
        log.line(rest);
    }

    if let Some(code) = status {
        return ExitStatus::Code(code);
    }

    for _ in 0..policy.exit_status_polls {
        match timeout(policy.exit_status_interval(), channel.wait()).await {
            Ok(Some(ChannelEvent::ExitStatus(code))) => return ExitStatus::Code(code),
            Ok(Some(_)) => {}
            // channel gone, nothing more can arrive
            Ok(None) => break,
            Err(_) => {}
        }
    }

    debug!("[exec] No exit status received");
    ExitStatus::Missing
}
