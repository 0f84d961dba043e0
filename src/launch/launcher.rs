//! Launcher — drives one bootstrap from bare instance to agent channel
//!
//! ```text
//! connect_with_retry ─► negotiate ─┬─ SameUser ──────────────────────────────┐
//!                                  └─ Reconnect ─► connect_with_retry        │
//!                                                  ─► authenticate_privileged ┤
//!                                                                            ▼
//!                                       AgentChannel ◄─ Provisioner::run ◄─ working session
//! ```
//!
//! The launcher owns the working session between negotiation and handoff and
//! closes it on every failure in that window. Before and after that window
//! the negotiator and the [`AgentChannel`] own it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::connector::connect_with_retry;
use super::error::BootstrapError;
use super::handoff::AgentChannel;
use super::negotiate::{authenticate_privileged, negotiate, Negotiated};
use super::provision::Provisioner;
use super::state::{Account, BootstrapState, BootstrapStateMachine};
use crate::config::LaunchConfig;
use crate::progress::ProgressLog;
use crate::provider::{ArtifactSource, CredentialProvider, InstanceDirectory};
use crate::ssh::{Connector, ExecChannel, RemoteSession};

/// Bootstraps one node with injected collaborators.
pub struct Launcher {
    config: Arc<LaunchConfig>,
    connector: Arc<dyn Connector>,
    directory: Arc<dyn InstanceDirectory>,
    credentials: Arc<dyn CredentialProvider>,
    artifacts: Arc<dyn ArtifactSource>,
    log: ProgressLog,
    state: Mutex<BootstrapStateMachine>,
}

impl Launcher {
    pub fn new(
        config: Arc<LaunchConfig>,
        connector: Arc<dyn Connector>,
        directory: Arc<dyn InstanceDirectory>,
        credentials: Arc<dyn CredentialProvider>,
        artifacts: Arc<dyn ArtifactSource>,
    ) -> Self {
        let launch_id = uuid::Uuid::new_v4().to_string();
        Self {
            config,
            connector,
            directory,
            credentials,
            artifacts,
            log: ProgressLog::tracing_only(launch_id),
            state: Mutex::new(BootstrapStateMachine::new()),
        }
    }

    /// Write progress lines to `log` instead of tracing only.
    pub fn with_log(mut self, log: ProgressLog) -> Self {
        self.log = log;
        self
    }

    /// Current bootstrap state
    pub fn state(&self) -> BootstrapState {
        self.state.lock().state()
    }

    /// States visited by the latest launch
    pub fn history(&self) -> Vec<BootstrapState> {
        self.state.lock().history().to_vec()
    }

    /// Bring the node up and hand back the agent's channel.
    ///
    /// On failure every session opened by this call has been closed by the
    /// time the error is returned.
    pub async fn launch(&self, cancel: &CancellationToken) -> Result<AgentChannel, BootstrapError> {
        *self.state.lock() = BootstrapStateMachine::new();
        info!(
            "[launcher] Bootstrap {} starting for {}",
            self.log.launch_id(),
            self.config.target.host
        );

        let result = self.bootstrap(cancel).await;
        if let Err(e) = &result {
            self.state.lock().fail(e.reason());
            match e {
                BootstrapError::Unexpected { .. } => {
                    self.log.line(format!("Something terrible happened... {}", e))
                }
                BootstrapError::Cancelled => self.log.line("Bootstrap cancelled"),
                _ => self.log.line(format!("Bootstrap failed: {}", e)),
            }
            if e.is_transient() {
                info!("[launcher] Bootstrap {} may be retried: {}", self.log.launch_id(), e);
            }
        }
        self.log.line("Session Terminated.");
        result
    }

    async fn bootstrap(&self, cancel: &CancellationToken) -> Result<AgentChannel, BootstrapError> {
        let key = self.credentials.admin_key_material().await?;
        let mut session = self.working_session(&key, cancel).await?;

        match self.provision(session.as_mut(), cancel).await {
            Ok(exec) => {
                let channel = AgentChannel::bind(exec, session, self.log.clone());
                self.advance(BootstrapState::HandedOff);
                Ok(channel)
            }
            Err(e) => {
                self.log.line("Closing SSH connection...");
                session.close().await;
                Err(e)
            }
        }
    }

    /// Session authenticated as the privileged account.
    async fn working_session(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>, BootstrapError> {
        let config = self.config.as_ref();

        self.advance(BootstrapState::Connecting);
        let session = self.connect(cancel).await?;

        self.advance(BootstrapState::Authenticating {
            account: Account::Admin,
        });
        let session = match negotiate(session, config, key, &self.log, cancel).await? {
            Negotiated::SameUser(session) => session,
            Negotiated::Reconnect => {
                self.advance(BootstrapState::Escalating);
                self.advance(BootstrapState::Reconnecting);
                let session = self.connect(cancel).await?;
                self.advance(BootstrapState::Authenticating {
                    account: Account::Privileged,
                });
                authenticate_privileged(session, config, key, &self.log).await?
            }
        };

        self.advance(BootstrapState::Working);
        Ok(session)
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RemoteSession>, BootstrapError> {
        connect_with_retry(
            self.directory.as_ref(),
            self.connector.as_ref(),
            &self.log,
            &self.config.retry,
            cancel,
        )
        .await
    }

    async fn provision(
        &self,
        session: &mut dyn RemoteSession,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ExecChannel>, BootstrapError> {
        self.advance(BootstrapState::Provisioning);
        Provisioner::new(&self.config, self.artifacts.as_ref(), &self.log, cancel)
            .run(session)
            .await
    }

    /// Transitions are fixed by the code above; a rejected one is a bug, not a
    /// reason to strand an open session.
    fn advance(&self, to: BootstrapState) {
        if let Err(e) = self.state.lock().advance(to) {
            warn!("[launcher] {}", e);
        }
    }
}
