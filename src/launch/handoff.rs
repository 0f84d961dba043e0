//! Channel Handoff — binds the agent's stdio to a byte channel
//!
//! The launched agent speaks its own protocol over stdin/stdout. This module
//! turns its exec channel into a bidirectional byte channel for the caller
//! and ties the SSH transport's lifetime to it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐      send()       ┌─────────────┐    stdin    ┌─────────┐
//! │    Caller    │ ────────────────▸ │   IO task   │ ──────────▸ │  Agent  │
//! │              │ ◂──────────────── │ (owns exec  │ ◂────────── │ process │
//! └──────────────┘      recv()       │ + session)  │    stdout   └─────────┘
//!                                    └─────────────┘
//! ```
//!
//! # Close ordering
//! The IO task owns both the exec channel and the session, so each is closed
//! exactly once, when the task ends. It ends on local `close()` / drop,
//! remote EOF / close / exit, or a failed write. A write stalled on a full
//! remote window still yields to a local close. The exec channel is closed
//! first, then the session, and only then is the [`CloseReason`] published
//! to subscribers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::progress::ProgressLog;
use crate::ssh::{ChannelEvent, ExecChannel, RemoteSession};

/// Buffered chunks in each direction
const CHANNEL_CAPACITY: usize = 256;

/// Why the handed-off channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed or dropped by the caller
    Local,
    /// Agent side sent EOF or closed the channel
    RemoteClosed,
    /// Agent process exited
    RemoteExited(u32),
    /// Writing to the agent's stdin failed
    WriteFailed(String),
    /// IO task ended without reporting (panicked)
    Aborted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::RemoteClosed => write!(f, "closed by remote"),
            CloseReason::RemoteExited(code) => write!(f, "agent exited with status {}", code),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {}", e),
            CloseReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// Handoff error.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("Agent channel closed")]
    ChannelClosed,
}

/// Cloneable write half of an [`AgentChannel`].
#[derive(Clone)]
pub struct AgentWriter {
    write_tx: mpsc::Sender<Bytes>,
}

impl AgentWriter {
    /// Queue bytes for the agent's stdin.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), HandoffError> {
        self.write_tx
            .send(data.into())
            .await
            .map_err(|_| HandoffError::ChannelClosed)
    }
}

/// Live byte channel to the launched agent.
pub struct AgentChannel {
    writer: AgentWriter,
    read_rx: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
    closed_rx: watch::Receiver<Option<CloseReason>>,
    alive: Arc<AtomicBool>,
}

impl AgentChannel {
    /// Take ownership of the agent's exec channel and its session.
    ///
    /// Spawns the IO task; must be called inside a tokio runtime.
    pub fn bind(
        mut channel: Box<dyn ExecChannel>,
        mut session: Box<dyn RemoteSession>,
        log: ProgressLog,
    ) -> Self {
        let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (read_tx, read_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));

        let shutdown_io = shutdown.clone();
        let alive_io = alive.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = shutdown_io.cancelled() => break CloseReason::Local,
                    outgoing = write_rx.recv() => match outgoing {
                        // a full remote window must not block teardown
                        Some(data) => {
                            tokio::select! {
                                written = channel.data(&data) => {
                                    if let Err(e) = written {
                                        break CloseReason::WriteFailed(e.to_string());
                                    }
                                }
                                _ = shutdown_io.cancelled() => break CloseReason::Local,
                            }
                        }
                        // every writer is gone
                        None => break CloseReason::Local,
                    },
                    event = channel.wait() => match event {
                        Some(ChannelEvent::Stdout(data)) => {
                            tokio::select! {
                                sent = read_tx.send(data) => {
                                    // receiver lives in the dropped AgentChannel
                                    if sent.is_err() {
                                        break CloseReason::Local;
                                    }
                                }
                                _ = shutdown_io.cancelled() => break CloseReason::Local,
                            }
                        }
                        // the agent protocol carries its own diagnostics
                        Some(ChannelEvent::Stderr(data)) => {
                            trace!("[handoff] dropped {} stderr bytes", data.len());
                        }
                        Some(ChannelEvent::ExitStatus(code)) => break CloseReason::RemoteExited(code),
                        Some(ChannelEvent::Eof) | Some(ChannelEvent::Close) | None => {
                            break CloseReason::RemoteClosed
                        }
                    },
                }
            };

            alive_io.store(false, Ordering::Release);
            drop(write_rx);
            drop(read_tx);
            channel.close().await;
            session.close().await;
            log.line(format!("Agent channel {}, SSH connection closed", reason));
            info!("[handoff] IO task ended: {}", reason);
            let _ = closed_tx.send(Some(reason));
        });

        debug!("[handoff] Agent channel bound");
        Self {
            writer: AgentWriter { write_tx },
            read_rx,
            shutdown,
            closed_rx,
            alive,
        }
    }

    /// Whether the IO task is still running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Queue bytes for the agent's stdin.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), HandoffError> {
        self.writer.send(data).await
    }

    /// A writer that can be moved to another task.
    pub fn writer(&self) -> AgentWriter {
        self.writer.clone()
    }

    /// Next chunk of agent stdout; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.read_rx.recv().await
    }

    /// Close the agent channel and its transport. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Subscribe to the close notification.
    ///
    /// The value turns `Some` after the exec channel and session are closed.
    pub fn subscribe_closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_rx.clone()
    }

    /// Wait until the channel has closed and its resources are released.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_rx.clone();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Aborted),
            Err(_) => CloseReason::Aborted,
        };
        reason
    }
}

impl Drop for AgentChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ssh::{Connector, TransportError};
    use crate::testing::{MockConnector, MockReply, MockShared};

    async fn bound(fail_writes: bool) -> (AgentChannel, Arc<MockShared>) {
        let shared = MockShared::new();
        shared.reply("-jar", MockReply::Interactive { fail_writes });
        let mut session = MockConnector::new(shared.clone())
            .connect("10.0.0.5", 22)
            .await
            .unwrap();
        let exec = session
            .open_exec("java -jar /tmp/slave.jar", false)
            .await
            .unwrap();
        let channel = AgentChannel::bind(exec, session, ProgressLog::tracing_only("handoff-test"));
        (channel, shared)
    }

    fn assert_closed_once(shared: &MockShared) {
        assert_eq!(shared.channel_close_count(), 1);
        assert_eq!(shared.session_closes(), vec![0]);
    }

    #[tokio::test]
    async fn test_immediate_close() {
        let (channel, shared) = bound(false).await;
        channel.close();

        assert_eq!(channel.closed().await, CloseReason::Local);
        assert!(!channel.is_alive());
        assert_closed_once(&shared);

        channel.close();
        assert!(channel.send(Bytes::from_static(b"late")).await.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_closed_once(&shared);
    }

    #[tokio::test]
    async fn test_close_after_write_error() {
        let (channel, shared) = bound(true).await;
        channel.send(Bytes::from_static(b"hello")).await.unwrap();

        assert!(matches!(channel.closed().await, CloseReason::WriteFailed(_)));
        assert_closed_once(&shared);

        channel.close();
        drop(channel);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_closed_once(&shared);
    }

    #[tokio::test]
    async fn test_close_after_remote_disconnect() {
        let (mut channel, shared) = bound(false).await;
        let remote = shared.remote_tx().unwrap();
        remote
            .send(ChannelEvent::Stdout(Bytes::from_static(b"<hello/>")))
            .unwrap();
        remote.send(ChannelEvent::Close).unwrap();

        assert_eq!(channel.recv().await, Some(Bytes::from_static(b"<hello/>")));
        assert_eq!(channel.closed().await, CloseReason::RemoteClosed);
        assert_eq!(channel.recv().await, None);
        assert_closed_once(&shared);

        channel.close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_closed_once(&shared);
    }

    #[tokio::test]
    async fn test_agent_exit_closes_transport() {
        let (channel, shared) = bound(false).await;
        shared
            .remote_tx()
            .unwrap()
            .send(ChannelEvent::ExitStatus(143))
            .unwrap();

        assert_eq!(channel.closed().await, CloseReason::RemoteExited(143));
        assert_closed_once(&shared);
    }

    #[tokio::test]
    async fn test_writes_reach_agent_stdin() {
        let (channel, shared) = bound(false).await;
        let writer = channel.writer();
        writer.send(Bytes::from_static(b"ping\n")).await.unwrap();
        channel.send(b"pong\n".to_vec()).await.unwrap();

        // stderr is ignored and does not close the channel
        shared
            .remote_tx()
            .unwrap()
            .send(ChannelEvent::Stderr(Bytes::from_static(b"warn")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(shared.written(), b"ping\npong\n");
        assert!(channel.is_alive());
        channel.close();
        channel.closed().await;
    }

    /// Agent that never drains its stdin
    struct StalledStdin {
        shared: Arc<MockShared>,
    }

    #[async_trait::async_trait]
    impl ExecChannel for StalledStdin {
        async fn wait(&mut self) -> Option<ChannelEvent> {
            std::future::pending().await
        }
        async fn data(&mut self, _data: &[u8]) -> Result<(), TransportError> {
            std::future::pending().await
        }
        async fn eof(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&mut self) {
            self.shared.channel_closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_write_stalled() {
        let shared = MockShared::new();
        let session = MockConnector::new(shared.clone())
            .connect("10.0.0.5", 22)
            .await
            .unwrap();
        let exec = Box::new(StalledStdin {
            shared: shared.clone(),
        });
        let channel = AgentChannel::bind(exec, session, ProgressLog::tracing_only("handoff-test"));

        channel.send(Bytes::from_static(b"x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(channel.is_alive());

        channel.close();
        let reason = tokio::time::timeout(Duration::from_secs(2), channel.closed())
            .await
            .expect("close must not wait for the stalled write");
        assert_eq!(reason, CloseReason::Local);
        assert!(!channel.is_alive());
        assert_closed_once(&shared);
    }

    #[tokio::test]
    async fn test_notification_fires_after_resources_closed() {
        let (channel, shared) = bound(false).await;
        let mut closed = channel.subscribe_closed();
        assert!(closed.borrow().is_none());

        drop(channel);
        closed.changed().await.unwrap();
        assert_eq!(*closed.borrow(), Some(CloseReason::Local));
        assert_closed_once(&shared);
    }
}
