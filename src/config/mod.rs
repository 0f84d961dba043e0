//! Configuration Management Module
//!
//! Handles the launch configuration: target node, accounts, init script,
//! runtime and agent settings, credential source, host key policy and retry
//! bounds.

pub mod storage;
pub mod types;

pub use storage::{config_dir, launch_config_file, StorageError};
pub use types::{
    AgentConfig, CredentialSource, LaunchConfig, RetryPolicy, RuntimeConfig, TargetConfig,
    CONFIG_VERSION,
};
