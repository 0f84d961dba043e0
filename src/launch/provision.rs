//! Provisioning sequence
//!
//! Runs on the privileged working session, in order:
//! 1. Init script, once per node filesystem (guarded by a marker file)
//! 2. Runtime check, installing the runtime archive when the probe fails
//! 3. Agent artifact upload to `/tmp`
//! 4. Agent launch on a dedicated exec channel
//!
//! Any failing step aborts the whole bootstrap. Nothing is rolled back.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::BootstrapError;
use super::exec::{run_command, run_pty_command};
use crate::config::LaunchConfig;
use crate::progress::ProgressLog;
use crate::provider::ArtifactSource;
use crate::ssh::{ExecChannel, RemoteSession};

/// Directory the init script is uploaded to
pub const INIT_SCRIPT_DIR: &str = "/tmp";
pub const INIT_SCRIPT_NAME: &str = "init.sh";

/// Zero-byte marker recording that the init script already ran
pub const INIT_MARKER_DIR: &str = "/";
pub const INIT_MARKER_NAME: &str = ".hudson-run-init";

/// Directory the agent artifact is uploaded to
pub const AGENT_REMOTE_DIR: &str = "/tmp";

const INIT_SCRIPT_MODE: u32 = 0o700;
const INIT_MARKER_MODE: u32 = 0o600;
const AGENT_ARTIFACT_MODE: u32 = 0o644;

/// What the init step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    NotConfigured,
    AlreadyRan,
    Ran,
}

/// What the runtime step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeOutcome {
    Present,
    Installed,
}

pub fn init_marker_path() -> String {
    format!("{}{}", INIT_MARKER_DIR, INIT_MARKER_NAME)
}

/// Drives the provisioning steps against one working session.
pub struct Provisioner<'a> {
    config: &'a LaunchConfig,
    artifacts: &'a dyn ArtifactSource,
    log: &'a ProgressLog,
    cancel: &'a CancellationToken,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        config: &'a LaunchConfig,
        artifacts: &'a dyn ArtifactSource,
        log: &'a ProgressLog,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            config,
            artifacts,
            log,
            cancel,
        }
    }

    /// Run every step and return the agent's exec channel.
    pub async fn run(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<Box<dyn ExecChannel>, BootstrapError> {
        self.checkpoint()?;
        let init = self.run_init_script(session).await?;
        debug!("[provision] init step: {:?}", init);

        self.checkpoint()?;
        let runtime = self.ensure_runtime(session).await?;
        debug!("[provision] runtime step: {:?}", runtime);

        self.checkpoint()?;
        self.deploy_artifact(session).await?;

        self.checkpoint()?;
        self.launch_agent(session).await
    }

    /// Cancellation is honoured between steps, never inside one.
    fn checkpoint(&self) -> Result<(), BootstrapError> {
        if self.cancel.is_cancelled() {
            return Err(BootstrapError::Cancelled);
        }
        Ok(())
    }

    /// Run the configured init script unless the marker says it already ran.
    pub async fn run_init_script(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<InitOutcome, BootstrapError> {
        if !self.config.has_init_script() {
            return Ok(InitOutcome::NotConfigured);
        }

        let policy = &self.config.retry;
        let check = format!("test -e {}", init_marker_path());
        if run_command(session, &check, self.log, policy).await?.success() {
            return Ok(InitOutcome::AlreadyRan);
        }

        self.log.line("Executing init script");
        session
            .upload(
                INIT_SCRIPT_DIR,
                INIT_SCRIPT_NAME,
                INIT_SCRIPT_MODE,
                self.config.init_script.as_bytes(),
            )
            .await?;

        // PTY so the remote side interleaves stdout and stderr
        let command = format!(
            "{}{}/{}",
            self.config.root_command_prefix, INIT_SCRIPT_DIR, INIT_SCRIPT_NAME
        );
        let status = run_pty_command(session, &command, self.log, policy).await?;
        if !status.success() {
            self.log
                .line(format!("init script failed: exit code={}", status));
            return Err(BootstrapError::InitFailed {
                exit_code: status.code(),
            });
        }

        session
            .upload(INIT_MARKER_DIR, INIT_MARKER_NAME, INIT_MARKER_MODE, &[])
            .await?;
        info!("[provision] Init script completed, marker written");
        Ok(InitOutcome::Ran)
    }

    /// Make sure the runtime is installed, installing it when the probe fails.
    pub async fn ensure_runtime(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<RuntimeOutcome, BootstrapError> {
        let policy = &self.config.retry;
        let runtime = &self.config.runtime;

        self.log.line("Verifying that java exists");
        if run_command(session, &runtime.probe_command, self.log, policy)
            .await?
            .success()
        {
            return Ok(RuntimeOutcome::Present);
        }

        self.log.line("Installing Java");
        let url = self
            .artifacts
            .presigned_download_url(&runtime.archive_path())
            .await?;
        let command = install_command(&runtime.version, url.as_str());
        let status = run_command(session, &command, self.log, policy).await?;
        if !status.success() {
            self.log.line("Unable to install Java");
            return Err(BootstrapError::InstallFailed {
                exit_code: status.code(),
            });
        }
        Ok(RuntimeOutcome::Installed)
    }

    /// Upload the agent artifact to `/tmp`.
    pub async fn deploy_artifact(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<(), BootstrapError> {
        let name = &self.config.agent.artifact_name;
        self.log.line(format!("Copying {}", name));
        let artifact = self.artifacts.agent_artifact().await?;
        session
            .upload(AGENT_REMOTE_DIR, name, AGENT_ARTIFACT_MODE, &artifact)
            .await?;
        debug!("[provision] Deployed {} ({} bytes)", name, artifact.len());
        Ok(())
    }

    /// Start the agent. Its channel is returned untouched for the handoff.
    pub async fn launch_agent(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<Box<dyn ExecChannel>, BootstrapError> {
        self.log.line("Launching slave agent");
        let command = launch_command(&self.config.jvm_opts, &self.config.agent.artifact_name);
        self.log.line(format!("Running {}", command));
        let channel = session.open_exec(&command, false).await?;
        Ok(channel)
    }
}

/// Download, unpack and link the runtime archive
pub fn install_command(version: &str, url: &str) -> String {
    format!(
        "wget -nv -O /usr/{v}.tgz '{url}' && tar xz -C /usr -f /usr/{v}.tgz && ln -s /usr/{v}/bin/java /bin/java",
        v = version,
        url = url
    )
}

/// Agent start command with the configured runtime options
pub fn launch_command(jvm_opts: &str, artifact_name: &str) -> String {
    let opts = jvm_opts.trim();
    if opts.is_empty() {
        format!("java -jar {}/{}", AGENT_REMOTE_DIR, artifact_name)
    } else {
        format!("java {} -jar {}/{}", opts, AGENT_REMOTE_DIR, artifact_name)
    }
}
