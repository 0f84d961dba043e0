//! Bootstrap State Machine
//!
//! Tracks where a launch is in the bootstrap sequence:
//!
//! ```text
//! ┌──────┐   ┌────────────┐   ┌─────────────────────┐
//! │ Idle │ ─►│ Connecting │ ─►│ Authenticating(adm) │
//! └──────┘   └────────────┘   └──────────┬──────────┘
//!                                        │
//!                   same user ┌──────────┴──────────┐ different user
//!                             ▼                     ▼
//!                      ┌─────────┐           ┌────────────┐
//!                      │ Working │◄──┐       │ Escalating │
//!                      └────┬────┘   │       └─────┬──────┘
//!                           │        │             ▼
//!                           ▼        │       ┌──────────────┐
//!                   ┌──────────────┐ │       │ Reconnecting │
//!                   │ Provisioning │ │       └─────┬────────┘
//!                   └──────┬───────┘ │             ▼
//!                          ▼         │  ┌──────────────────────┐
//!                    ┌───────────┐   └──│ Authenticating(priv) │
//!                    │ HandedOff │      └──────────────────────┘
//!                    └───────────┘
//! ```
//!
//! Any non-terminal state may move to `Failed`.

use std::fmt;

use serde::Serialize;
use tokio::time::Instant;

/// Account being authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Account {
    Admin,
    Privileged,
}

/// Bootstrap states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum BootstrapState {
    #[default]
    Idle,
    /// Waiting for an address and a listening sshd
    Connecting,
    Authenticating { account: Account },
    /// Authorizing the admin key for the privileged account
    Escalating,
    Reconnecting,
    /// Authenticated as the privileged account
    Working,
    Provisioning,
    /// Agent channel given to the caller
    HandedOff,
    Failed { reason: &'static str },
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Authenticating { account: Account::Admin } => write!(f, "authenticating(admin)"),
            Self::Authenticating {
                account: Account::Privileged,
            } => write!(f, "authenticating(privileged)"),
            Self::Escalating => write!(f, "escalating"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Working => write!(f, "working"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::HandedOff => write!(f, "handedOff"),
            Self::Failed { reason } => write!(f, "failed({})", reason),
        }
    }
}

impl BootstrapState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::HandedOff | Self::Failed { .. })
    }

    fn allows(&self, to: &BootstrapState) -> bool {
        use Account::*;
        use BootstrapState::*;

        match (self, to) {
            (_, Failed { .. }) => !self.is_terminal(),
            (Idle, Connecting) => true,
            (Connecting, Authenticating { account: Admin }) => true,
            (Authenticating { account: Admin }, Working) => true,
            (Authenticating { account: Admin }, Escalating) => true,
            (Escalating, Reconnecting) => true,
            (Reconnecting, Authenticating { account: Privileged }) => true,
            (Authenticating { account: Privileged }, Working) => true,
            (Working, Provisioning) => true,
            (Provisioning, HandedOff) => true,
            _ => false,
        }
    }
}

/// Validates and records bootstrap state changes.
#[derive(Debug)]
pub struct BootstrapStateMachine {
    state: BootstrapState,
    history: Vec<BootstrapState>,
    state_changed_at: Instant,
}

impl Default for BootstrapStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapStateMachine {
    pub fn new() -> Self {
        Self {
            state: BootstrapState::Idle,
            history: vec![BootstrapState::Idle],
            state_changed_at: Instant::now(),
        }
    }

    /// Get current state
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Every state visited, oldest first
    pub fn history(&self) -> &[BootstrapState] {
        &self.history
    }

    /// Move to `to` if the bootstrap sequence allows it.
    pub fn advance(&mut self, to: BootstrapState) -> Result<(), StateTransitionError> {
        if !self.state.allows(&to) {
            return Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.transition_to(to);
        Ok(())
    }

    /// Record a failure. No-op once the machine is terminal.
    pub fn fail(&mut self, reason: &'static str) {
        if !self.state.is_terminal() {
            self.transition_to(BootstrapState::Failed { reason });
        }
    }

    fn transition_to(&mut self, new_state: BootstrapState) {
        tracing::debug!(
            "[bootstrap] State transition: {} -> {} after {:?}",
            self.state,
            new_state,
            self.state_changed_at.elapsed()
        );
        self.state = new_state;
        self.state_changed_at = Instant::now();
        self.history.push(new_state);
    }
}

/// Error type for invalid state transitions
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid bootstrap transition from {from} to {to}")]
    InvalidTransition {
        from: BootstrapState,
        to: BootstrapState,
    },
}
