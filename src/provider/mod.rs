//! Collaborator interfaces
//!
//! The bootstrap sequence needs three things from the surrounding system: where
//! the node currently is, the shared admin key, and the artifacts to install.
//! They are injected into [`crate::launch::Launcher`] as trait objects.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

use crate::config::{CredentialSource, LaunchConfig};

/// Address a booting instance reports before it has one
pub const UNASSIGNED_ADDRESS: &str = "0.0.0.0";

/// Errors raised by collaborators
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Instance lookup failed: {0}")]
    Lookup(String),

    #[error("Credential unavailable: {0}")]
    Credential(String),

    #[error("Artifact unavailable: {0}")]
    Artifact(String),
}

/// Instance metadata lookup.
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Re-describe the instance and return its private address.
    ///
    /// Returns [`UNASSIGNED_ADDRESS`] while the instance has no address yet.
    async fn refresh_private_address(&self) -> Result<String, ProviderError>;

    fn ssh_port(&self) -> u16;
}

/// Source of the shared administrative key.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// PEM encoded private key
    async fn admin_key_material(&self) -> Result<String, ProviderError>;
}

/// Artifact store access.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Signed URL the node can download `path` from.
    async fn presigned_download_url(&self, path: &str) -> Result<Url, ProviderError>;

    /// The agent's executable artifact.
    async fn agent_artifact(&self) -> Result<Bytes, ProviderError>;
}

/// Directory for a node whose address is known up front.
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    host: String,
    port: u16,
}

impl StaticDirectory {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_config(config: &LaunchConfig) -> Self {
        Self::new(config.target.host.clone(), config.target.port)
    }
}

#[async_trait]
impl InstanceDirectory for StaticDirectory {
    async fn refresh_private_address(&self) -> Result<String, ProviderError> {
        Ok(self.host.clone())
    }

    fn ssh_port(&self) -> u16 {
        self.port
    }
}

/// Private key read from a PEM file on every request.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialProvider for FileCredentials {
    async fn admin_key_material(&self) -> Result<String, ProviderError> {
        tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ProviderError::Credential(format!("{}: {}", self.path.display(), e))
        })
    }
}

/// Private key stored in the system keychain.
#[derive(Debug, Clone)]
pub struct KeychainCredentials {
    service: String,
    account: String,
}

impl KeychainCredentials {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for KeychainCredentials {
    async fn admin_key_material(&self) -> Result<String, ProviderError> {
        let service = self.service.clone();
        let account = self.account.clone();
        // keychain backends block on IPC
        tokio::task::spawn_blocking(move || {
            keyring::Entry::new(&service, &account)
                .and_then(|entry| entry.get_password())
                .map_err(|e| ProviderError::Credential(format!("{}/{}: {}", service, account, e)))
        })
        .await
        .map_err(|e| ProviderError::Credential(e.to_string()))?
    }
}

/// Build the credential provider a configuration names.
pub fn credentials_from_config(source: &CredentialSource) -> Box<dyn CredentialProvider> {
    match source {
        CredentialSource::File { path } => Box::new(FileCredentials::new(path)),
        CredentialSource::Keychain { service, account } => {
            Box::new(KeychainCredentials::new(service, account))
        }
    }
}

/// Agent artifact on local disk, runtime archives under a base URL.
#[derive(Debug, Clone)]
pub struct LocalArtifacts {
    agent_path: PathBuf,
    download_base: Option<Url>,
}

impl LocalArtifacts {
    pub fn new(agent_path: impl Into<PathBuf>, download_base: Option<Url>) -> Self {
        Self {
            agent_path: agent_path.into(),
            download_base: download_base.map(as_directory),
        }
    }
}

/// Relative joins replace the last path segment unless the base ends in `/`.
fn as_directory(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

#[async_trait]
impl ArtifactSource for LocalArtifacts {
    async fn presigned_download_url(&self, path: &str) -> Result<Url, ProviderError> {
        let base = self.download_base.as_ref().ok_or_else(|| {
            ProviderError::Artifact("no download_base_url configured".to_string())
        })?;
        base.join(path.trim_start_matches('/'))
            .map_err(|e| ProviderError::Artifact(format!("{}: {}", path, e)))
    }

    async fn agent_artifact(&self) -> Result<Bytes, ProviderError> {
        tokio::fs::read(&self.agent_path)
            .await
            .map(Bytes::from)
            .map_err(|e| ProviderError::Artifact(format!("{}: {}", self.agent_path.display(), e)))
    }
}
