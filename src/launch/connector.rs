//! Connect-with-retry
//!
//! A fresh instance goes through a window where it has no address yet, then
//! one where it has an address but sshd is not listening. Both are "not ready
//! yet": back off and try again, without limit unless a connect timeout is
//! configured.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::BootstrapError;
use crate::config::RetryPolicy;
use crate::progress::ProgressLog;
use crate::provider::{InstanceDirectory, UNASSIGNED_ADDRESS};
use crate::ssh::{Connector, RemoteSession};

/// Open a transport to the instance, retrying until it accepts connections.
///
/// Only fails when cancelled, when the optional connect timeout elapses, or
/// when the instance directory itself fails.
pub async fn connect_with_retry(
    directory: &dyn InstanceDirectory,
    connector: &dyn Connector,
    log: &ProgressLog,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Box<dyn RemoteSession>, BootstrapError> {
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(BootstrapError::Cancelled);
        }
        attempt += 1;

        let host = directory.refresh_private_address().await?;
        if host == UNASSIGNED_ADDRESS {
            log.line(format!(
                "Invalid host {}, your host is most likely waiting for an ip address.",
                UNASSIGNED_ADDRESS
            ));
        } else {
            let port = directory.ssh_port();
            log.line(format!("Connecting to {} on port {}. ", host, port));
            match connector.connect(&host, port).await {
                Ok(session) => {
                    log.line("Connected via SSH.");
                    debug!("[connect] Connected to {}:{} after {} attempt(s)", host, port, attempt);
                    return Ok(session);
                }
                Err(e) => {
                    debug!("[connect] Attempt {} to {}:{} failed: {}", attempt, host, port, e);
                }
            }
        }

        if let Some(limit) = policy.connect_timeout() {
            if started.elapsed() + policy.connect_backoff() > limit {
                log.line("Giving up waiting for SSH.");
                return Err(BootstrapError::Unreachable {
                    waited_secs: started.elapsed().as_secs(),
                });
            }
        }

        log.line(format!(
            "Waiting for SSH to come up. Sleeping {}.",
            policy.connect_backoff_secs
        ));
        tokio::select! {
            _ = cancel.cancelled() => return Err(BootstrapError::Cancelled),
            _ = tokio::time::sleep(policy.connect_backoff()) => {}
        }
    }
}
