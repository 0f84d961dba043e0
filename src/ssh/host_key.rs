//! Host identity verification strategies
//!
//! Ephemeral cloud instances generate their host keys on first boot, so there is
//! no interactive step where an operator could pre-authorize them. The default
//! strategy therefore accepts any presented key and trusts the network path
//! instead. Deployments that bake host keys into their images can pin the
//! fingerprints instead.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Host key as presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedHostKey {
    /// Key algorithm, e.g. `ssh-ed25519`
    pub algorithm: String,
    /// OpenSSH style fingerprint, e.g. `SHA256:uNiVztksCsDhcc0u9e8BujQXVUpKZIDTMczCvj3tD2s`
    pub fingerprint: String,
}

/// Decides whether a presented host key is trusted.
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, port: u16, key: &PresentedHostKey) -> bool;
}

/// Accepts every host key unconditionally.
///
/// Trust is placed in the network path between launcher and instance. The
/// fingerprint is still logged so it can be audited afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, host: &str, port: u16, key: &PresentedHostKey) -> bool {
        info!(
            "[host-key] Accepting {} key {} for {}:{} without verification",
            key.algorithm, key.fingerprint, host, port
        );
        true
    }
}

/// Accepts only keys whose SHA256 fingerprint is in a known list.
#[derive(Debug, Clone)]
pub struct PinnedFingerprints {
    fingerprints: Vec<String>,
}

impl PinnedFingerprints {
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fingerprints: fingerprints
                .into_iter()
                .filter_map(|f| normalize_fingerprint(f.as_ref()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

impl HostKeyVerifier for PinnedFingerprints {
    fn verify(&self, host: &str, port: u16, key: &PresentedHostKey) -> bool {
        let Some(presented) = normalize_fingerprint(&key.fingerprint) else {
            warn!("[host-key] Unparseable fingerprint from {}:{}", host, port);
            return false;
        };
        let trusted = self.fingerprints.iter().any(|f| *f == presented);
        if !trusted {
            warn!(
                "[host-key] Rejecting {} key {} for {}:{}: not in pinned set",
                key.algorithm, key.fingerprint, host, port
            );
        }
        trusted
    }
}

/// Strip the `SHA256:` prefix and base64 padding so `SHA256:abc=` and `abc` compare equal.
fn normalize_fingerprint(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let body = trimmed
        .strip_prefix("SHA256:")
        .or_else(|| trimmed.strip_prefix("sha256:"))
        .unwrap_or(trimmed)
        .trim_end_matches('=');
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

/// Host key policy as written in the launch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept whatever the instance presents
    #[default]
    AcceptAny,
    /// Accept only the listed SHA256 fingerprints
    Pinned { fingerprints: Vec<String> },
}

impl HostKeyPolicy {
    /// Build the verifier this policy describes.
    pub fn verifier(&self) -> std::sync::Arc<dyn HostKeyVerifier> {
        match self {
            HostKeyPolicy::AcceptAny => std::sync::Arc::new(AcceptAnyHostKey),
            HostKeyPolicy::Pinned { fingerprints } => {
                std::sync::Arc::new(PinnedFingerprints::new(fingerprints))
            }
        }
    }
}
