//! Bootstrap errors

use crate::provider::ProviderError;
use crate::ssh::TransportError;

/// Why a bootstrap attempt ended without a handed-off channel.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Host unreachable after {waited_secs}s")]
    Unreachable { waited_secs: u64 },

    #[error("Authentication as {user} failed after {attempts} attempt(s)")]
    AuthFailed { user: String, attempts: u32 },

    #[error("Privilege escalation failed: exit code={exit_code}")]
    EscalationFailed { exit_code: i32 },

    #[error("Command '{command}' failed: exit code={exit_code}")]
    RemoteCommandFailed { command: String, exit_code: i32 },

    #[error("Init script failed: exit code={exit_code}")]
    InitFailed { exit_code: i32 },

    #[error("Runtime install failed: exit code={exit_code}")]
    InstallFailed { exit_code: i32 },

    #[error("Bootstrap cancelled")]
    Cancelled,

    #[error("Collaborator error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Unexpected {kind}: {message}")]
    Unexpected { kind: &'static str, message: String },
}

impl BootstrapError {
    /// Whether re-running the whole bootstrap later may succeed.
    ///
    /// Terminal conditions (rejected credentials, failing scripts) will fail
    /// the same way again until someone changes the node or configuration.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BootstrapError::Unreachable { .. } | BootstrapError::Unexpected { .. }
        )
    }

    /// Short label of the failed state, used in logs
    pub fn reason(&self) -> &'static str {
        match self {
            BootstrapError::Unreachable { .. } => "unreachable",
            BootstrapError::AuthFailed { .. } => "authFailed",
            BootstrapError::EscalationFailed { .. } => "escalationFailed",
            BootstrapError::RemoteCommandFailed { .. } => "remoteCommandFailed",
            BootstrapError::InitFailed { .. } => "initFailed",
            BootstrapError::InstallFailed { .. } => "installFailed",
            BootstrapError::Cancelled => "cancelled",
            BootstrapError::Provider(_) => "providerFailed",
            BootstrapError::Unexpected { .. } => "unexpected",
        }
    }
}

impl From<TransportError> for BootstrapError {
    fn from(e: TransportError) -> Self {
        BootstrapError::Unexpected {
            kind: "transport error",
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BootstrapError::Unreachable { waited_secs: 60 }.is_transient());
        assert!(BootstrapError::from(TransportError::SessionClosed).is_transient());
        assert!(!BootstrapError::AuthFailed {
            user: "root".to_string(),
            attempts: 20
        }
        .is_transient());
        assert!(!BootstrapError::InitFailed { exit_code: 2 }.is_transient());
        assert!(!BootstrapError::Cancelled.is_transient());
    }

    #[test]
    fn test_display() {
        let e = BootstrapError::EscalationFailed { exit_code: 1 };
        assert_eq!(e.to_string(), "Privilege escalation failed: exit code=1");
        assert_eq!(e.reason(), "escalationFailed");
    }
}
