//! Bootstrap negotiation
//!
//! Authenticates as the image's admin user and, when that user is not the
//! privileged account, authorizes the shared key for the privileged account so
//! the launcher can reconnect as it.
//!
//! Session ownership: `negotiate` consumes the bootstrap session. It is handed
//! back only as [`Negotiated::SameUser`]; every other path closes it.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::BootstrapError;
use super::exec::run_pty_command;
use crate::config::LaunchConfig;
use crate::progress::ProgressLog;
use crate::ssh::RemoteSession;

/// Successful outcome of the negotiation phase.
pub enum Negotiated {
    /// The admin user is the privileged account; keep using this session
    SameUser(Box<dyn RemoteSession>),
    /// Escalation done; open a new session as the privileged account
    Reconnect,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Negotiated::SameUser(_) => write!(f, "SameUser"),
            Negotiated::Reconnect => write!(f, "Reconnect"),
        }
    }
}

/// Command that authorizes the admin user's keys for the privileged account
pub fn escalation_command(config: &LaunchConfig) -> String {
    format!(
        "{}cp ~/.ssh/authorized_keys ~{}/.ssh/",
        config.root_command_prefix, config.privileged_user
    )
}

/// Authenticate as the admin user and escalate if needed.
pub async fn negotiate(
    mut session: Box<dyn RemoteSession>,
    config: &LaunchConfig,
    key: &str,
    log: &ProgressLog,
    cancel: &CancellationToken,
) -> Result<Negotiated, BootstrapError> {
    let policy = &config.retry;
    let user = config.admin_user.as_str();

    let mut attempts: u32 = 0;
    let mut authenticated = false;
    while attempts < policy.auth_attempts {
        attempts += 1;
        log.line(format!("Authenticating as {}", user));
        match session.authenticate_publickey(user, key).await {
            Ok(true) => {
                authenticated = true;
                break;
            }
            Ok(false) => {}
            Err(e) => debug!("[negotiate] Auth attempt {} errored: {}", attempts, e),
        }

        if attempts < policy.auth_attempts {
            log.line("Authentication failed. Trying again...");
            tokio::select! {
                _ = cancel.cancelled() => {
                    session.close().await;
                    return Err(BootstrapError::Cancelled);
                }
                _ = tokio::time::sleep(policy.auth_pause()) => {}
            }
        }
    }

    if !authenticated {
        log.line("Authentication failed");
        session.close().await;
        return Err(BootstrapError::AuthFailed {
            user: user.to_string(),
            attempts,
        });
    }

    if config.admin_is_privileged() {
        return Ok(Negotiated::SameUser(session));
    }

    // Get the privileged account working so uploads land with the right owner
    let command = escalation_command(config);
    let status = run_pty_command(session.as_mut(), &command, log, policy).await;
    // superseded by the reconnect either way
    session.close().await;

    let status = status?;
    if !status.success() {
        log.line(format!(
            "Privilege escalation failed: exit code={}",
            status
        ));
        return Err(BootstrapError::EscalationFailed {
            exit_code: status.code(),
        });
    }

    log.line(format!(
        "Authorized keys copied to {}, reconnecting",
        config.privileged_user
    ));
    Ok(Negotiated::Reconnect)
}

/// Single authentication attempt as the privileged account after a reconnect.
///
/// sshd is known to be up at this point, so there is no retry.
pub async fn authenticate_privileged(
    mut session: Box<dyn RemoteSession>,
    config: &LaunchConfig,
    key: &str,
    log: &ProgressLog,
) -> Result<Box<dyn RemoteSession>, BootstrapError> {
    let user = config.privileged_user.as_str();
    log.line(format!("Authenticating as {}", user));
    match session.authenticate_publickey(user, key).await {
        Ok(true) => Ok(session),
        outcome => {
            if let Err(e) = outcome {
                debug!("[negotiate] Privileged auth errored: {}", e);
            }
            log.line("Authentication failed");
            session.close().await;
            Err(BootstrapError::AuthFailed {
                user: user.to_string(),
                attempts: 1,
            })
        }
    }
}
