//! Configuration Types
//!
//! The launch configuration describes one target node and how to bring it up.
//! It is versioned so later releases can migrate older files.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ssh::HostKeyPolicy;

/// Current configuration version
pub const CONFIG_VERSION: u32 = 1;

/// Where the target node lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Private address of the instance; `0.0.0.0` while it is still booting
    pub host: String,

    /// SSH port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where the shared administrative private key comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    /// PEM encoded private key on disk
    File {
        /// Path to private key file
        path: String,
    },
    /// PEM stored in the system keychain
    Keychain {
        /// Keychain service name
        service: String,
        /// Keychain account name
        account: String,
    },
}

/// Runtime the agent needs on the node, and how to install it when missing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Versioned directory name of the runtime archive (`<version>.tgz`)
    #[serde(default = "default_runtime_version")]
    pub version: String,

    /// Directory of the archive inside the artifact store
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,

    /// Command whose exit status tells whether the runtime is installed
    #[serde(default = "default_probe_command")]
    pub probe_command: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: default_runtime_version(),
            archive_dir: default_archive_dir(),
            probe_command: default_probe_command(),
        }
    }
}

impl RuntimeConfig {
    /// Path of the runtime archive inside the artifact store
    pub fn archive_path(&self) -> String {
        format!(
            "{}/{}.tgz",
            self.archive_dir.trim_end_matches('/'),
            self.version
        )
    }
}

/// The agent artifact deployed to `/tmp`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// File name on the remote side, e.g. `slave.jar`
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,

    /// Local file holding the artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            artifact_name: default_artifact_name(),
            local_path: None,
        }
    }
}

/// Timing and retry bounds for each step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Pause between connection attempts
    pub connect_backoff_secs: u64,

    /// Give up connecting after this long (unbounded when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// TCP connect + SSH handshake timeout for a single attempt
    pub handshake_timeout_secs: u64,

    /// Maximum public key attempts as the admin user
    pub auth_attempts: u32,

    /// Pause between admin authentication attempts
    pub auth_pause_secs: u64,

    /// Number of polls for a late exit status
    pub exit_status_polls: u32,

    /// Interval between exit status polls
    pub exit_status_poll_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_backoff_secs: 5,
            connect_timeout_secs: None,
            handshake_timeout_secs: 30,
            auth_attempts: 20,
            auth_pause_secs: 10,
            exit_status_polls: 10,
            exit_status_poll_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_secs(self.connect_backoff_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn auth_pause(&self) -> Duration {
        Duration::from_secs(self.auth_pause_secs)
    }

    pub fn exit_status_interval(&self) -> Duration {
        Duration::from_millis(self.exit_status_poll_ms)
    }
}

/// A launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Configuration version
    pub version: u32,

    /// Target node
    pub target: TargetConfig,

    /// Account the shared key is authorized for on a fresh image
    #[serde(default = "default_privileged_user")]
    pub admin_user: String,

    /// Account provisioning runs as
    #[serde(default = "default_privileged_user")]
    pub privileged_user: String,

    /// Prefix that runs a command as the privileged user from the admin account, e.g. `sudo `
    #[serde(default)]
    pub root_command_prefix: String,

    /// Script run once per node filesystem (empty = none)
    #[serde(default)]
    pub init_script: String,

    /// Extra options for the agent's runtime
    #[serde(default)]
    pub jvm_opts: String,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    /// Admin key source
    pub credentials: CredentialSource,

    /// Base URL that runtime archive paths are resolved against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_base_url: Option<Url>,

    /// Host key trust strategy
    #[serde(default)]
    pub host_key: HostKeyPolicy,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_port() -> u16 {
    22
}

fn default_privileged_user() -> String {
    "root".to_string()
}

fn default_runtime_version() -> String {
    "java1.6.0_12".to_string()
}

fn default_archive_dir() -> String {
    "/hudson-ci/jdk/linux-i586".to_string()
}

fn default_probe_command() -> String {
    "java -fullversion".to_string()
}

fn default_artifact_name() -> String {
    "slave.jar".to_string()
}

impl LaunchConfig {
    /// Minimal configuration for a host reachable with a key file
    pub fn new(host: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            version: CONFIG_VERSION,
            target: TargetConfig {
                host: host.into(),
                port: default_port(),
            },
            admin_user: default_privileged_user(),
            privileged_user: default_privileged_user(),
            root_command_prefix: String::new(),
            init_script: String::new(),
            jvm_opts: String::new(),
            runtime: RuntimeConfig::default(),
            agent: AgentConfig::default(),
            credentials: CredentialSource::File {
                path: key_path.into(),
            },
            download_base_url: None,
            host_key: HostKeyPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Whether a non-blank init script is configured
    pub fn has_init_script(&self) -> bool {
        !self.init_script.trim().is_empty()
    }

    /// Whether the admin account already is the privileged account
    pub fn admin_is_privileged(&self) -> bool {
        self.admin_user == self.privileged_user
    }

    /// Check values the bootstrap cannot work without.
    pub fn validate(&self) -> Result<(), String> {
        if self.target.host.trim().is_empty() {
            return Err("target.host must not be empty".to_string());
        }
        if self.admin_user.trim().is_empty() {
            return Err("admin_user must not be empty".to_string());
        }
        if self.privileged_user.trim().is_empty() {
            return Err("privileged_user must not be empty".to_string());
        }
        if self.runtime.version.trim().is_empty() {
            return Err("runtime.version must not be empty".to_string());
        }
        let name = &self.agent.artifact_name;
        if name.is_empty() || name.contains('/') {
            return Err(format!("agent.artifact_name '{}' is not a file name", name));
        }
        if self.retry.auth_attempts == 0 {
            return Err("retry.auth_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}
