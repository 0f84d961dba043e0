//! Transport abstraction
//!
//! The bootstrap sequence talks to remote hosts only through these traits so the
//! whole protocol can run against an in-memory transport in tests. The russh
//! backend lives in [`super::client`].
//!
//! ```text
//! Connector ──connect()──▸ RemoteSession ──open_exec()──▸ ExecChannel
//!                               │
//!                               └──upload()──▸ file at remote path
//! ```

use async_trait::async_trait;
use bytes::Bytes;

use super::error::TransportError;

/// A single event read from an exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes written by the remote process to stdout
    Stdout(Bytes),
    /// Bytes written by the remote process to stderr
    Stderr(Bytes),
    /// Exit status reported by the remote side
    ExitStatus(u32),
    /// Remote side will send no more data
    Eof,
    /// Channel closed by the remote side
    Close,
}

/// Opens secure transports to a host.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open an unauthenticated transport to `host:port`.
    ///
    /// Host identity is checked during the handshake by the connector's
    /// configured verifier; a rejected key surfaces as
    /// [`TransportError::HostKeyRejected`].
    async fn connect(&self, host: &str, port: u16)
        -> Result<Box<dyn RemoteSession>, TransportError>;
}

/// An open transport to one remote host.
#[async_trait]
pub trait RemoteSession: Send {
    /// Try public-key authentication. `Ok(false)` means the server rejected the key.
    async fn authenticate_publickey(
        &mut self,
        user: &str,
        key_pem: &str,
    ) -> Result<bool, TransportError>;

    /// Open a fresh channel and start `command` on it.
    ///
    /// With `pty` set, a dumb terminal is requested first so the remote side
    /// merges stderr into stdout.
    async fn open_exec(
        &mut self,
        command: &str,
        pty: bool,
    ) -> Result<Box<dyn ExecChannel>, TransportError>;

    /// Write `content` to `remote_dir/name` with the given unix mode.
    async fn upload(
        &mut self,
        remote_dir: &str,
        name: &str,
        mode: u32,
        content: &[u8],
    ) -> Result<(), TransportError>;

    /// Tear down the transport. Safe to call on an already closed session.
    async fn close(&mut self);
}

/// One command execution channel.
#[async_trait]
pub trait ExecChannel: Send {
    /// Next event from the remote side, `None` once the channel is gone.
    ///
    /// Must be cancel safe: dropping the returned future loses no event.
    async fn wait(&mut self) -> Option<ChannelEvent>;

    /// Write bytes to the remote process's stdin.
    async fn data(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the remote process's stdin.
    async fn eof(&mut self) -> Result<(), TransportError>;

    /// Close the channel.
    async fn close(&mut self);
}
