//! russh-backed transport
//!
//! Implements [`Connector`], [`RemoteSession`] and [`ExecChannel`] on top of a
//! russh client handle. File uploads go through an SFTP subsystem channel
//! opened per upload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use russh::client::{self, Handle, Msg};
use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::error::TransportError;
use super::host_key::{HostKeyVerifier, PresentedHostKey};
use super::transport::{ChannelEvent, Connector, ExecChannel, RemoteSession};

/// Terminal type requested for PTY-backed commands
const PTY_TERM: &str = "dumb";

/// Default timeout for TCP connect + SSH handshake
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens russh sessions, checking host keys with the configured verifier.
pub struct RusshConnector {
    verifier: Arc<dyn HostKeyVerifier>,
    handshake_timeout: Duration,
    keepalive_interval: Option<Duration>,
}

impl RusshConnector {
    pub fn new(verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            verifier,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn RemoteSession>, TransportError> {
        let config = Arc::new(client::Config {
            keepalive_interval: self.keepalive_interval,
            ..Default::default()
        });

        let rejected = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: host.to_string(),
            port,
            verifier: self.verifier.clone(),
            rejected: rejected.clone(),
        };

        let handle = tokio::time::timeout(
            self.handshake_timeout,
            client::connect(config, (host, port), handler),
        )
        .await
        .map_err(|_| {
            TransportError::Connect(format!(
                "handshake with {}:{} timed out after {}s",
                host,
                port,
                self.handshake_timeout.as_secs()
            ))
        })?
        .map_err(|e| {
            if let Some(fingerprint) = rejected.lock().take() {
                TransportError::HostKeyRejected {
                    host: host.to_string(),
                    port,
                    fingerprint,
                }
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        debug!("[ssh] Transport established to {}:{}", host, port);
        Ok(Box::new(RusshSession {
            handle,
            closed: false,
        }))
    }
}

/// russh client handler; only host key checking is customised.
struct ClientHandler {
    host: String,
    port: u16,
    verifier: Arc<dyn HostKeyVerifier>,
    rejected: Arc<Mutex<Option<String>>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let presented = PresentedHostKey {
            algorithm: server_public_key.algorithm().to_string(),
            fingerprint: server_public_key.fingerprint(HashAlg::Sha256).to_string(),
        };
        let trusted = self.verifier.verify(&self.host, self.port, &presented);
        if !trusted {
            *self.rejected.lock() = Some(presented.fingerprint);
        }
        Ok(trusted)
    }
}

/// An open russh session.
pub struct RusshSession {
    handle: Handle<ClientHandler>,
    closed: bool,
}

impl RusshSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed || self.handle.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn authenticate_publickey(
        &mut self,
        user: &str,
        key_pem: &str,
    ) -> Result<bool, TransportError> {
        self.ensure_open()?;
        let key = decode_secret_key(key_pem, None)
            .map_err(|e| TransportError::InvalidKey(e.to_string()))?;

        // RSA keys need the strongest hash the server advertises
        let hash_alg = self
            .handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| TransportError::Auth(e.to_string()))?
            .flatten();

        let result = self
            .handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
            .await
            .map_err(|e| TransportError::Auth(e.to_string()))?;

        Ok(result.success())
    }

    async fn open_exec(
        &mut self,
        command: &str,
        pty: bool,
    ) -> Result<Box<dyn ExecChannel>, TransportError> {
        self.ensure_open()?;
        let channel = self.handle.channel_open_session().await?;
        if pty {
            channel
                .request_pty(false, PTY_TERM, 80, 24, 0, 0, &[])
                .await?;
        }
        channel.exec(true, command).await?;
        Ok(Box::new(RusshExecChannel { channel }))
    }

    async fn upload(
        &mut self,
        remote_dir: &str,
        name: &str,
        mode: u32,
        content: &[u8],
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let path = remote_path(remote_dir, name);
        let upload_err = |message: String| TransportError::Upload {
            path: path.clone(),
            message,
        };

        let channel = self.handle.channel_open_session().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| upload_err(format!("sftp subsystem: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| upload_err(format!("sftp init: {}", e)))?;

        let mut file = sftp
            .create(path.clone())
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        file.write_all(content)
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        file.shutdown()
            .await
            .map_err(|e| upload_err(e.to_string()))?;

        sftp.set_metadata(
            path.clone(),
            FileAttributes {
                permissions: Some(mode),
                ..FileAttributes::empty()
            },
        )
        .await
        .map_err(|e| upload_err(format!("chmod {:o}: {}", mode, e)))?;

        if let Err(e) = sftp.close().await {
            debug!("[ssh] sftp close after upload of {} failed: {}", path, e);
        }
        debug!("[ssh] Uploaded {} bytes to {}", content.len(), path);
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("[ssh] Disconnect failed: {}", e);
        }
    }
}

/// Exec channel over a russh session channel.
struct RusshExecChannel {
    channel: Channel<Msg>,
}

#[async_trait]
impl ExecChannel for RusshExecChannel {
    async fn wait(&mut self) -> Option<ChannelEvent> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { data } => ChannelEvent::Stdout(Bytes::copy_from_slice(&data)),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    ChannelEvent::Stderr(Bytes::copy_from_slice(&data))
                }
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => ChannelEvent::Close,
                // window adjustments, success replies, signals
                _ => continue,
            };
            return Some(event);
        }
    }

    async fn data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn eof(&mut self) -> Result<(), TransportError> {
        self.channel.eof().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close().await {
            debug!("[ssh] Channel close: {}", e);
        }
    }
}

/// Join a remote directory and file name without doubling the separator.
fn remote_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
