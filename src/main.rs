//! nodelaunch CLI
//!
//! Bootstraps the node described by a launch configuration, then bridges the
//! agent's channel to this process's stdin/stdout until either side closes.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nodelaunch_lib::config::{launch_config_file, LaunchConfig};
use nodelaunch_lib::launch::{AgentChannel, CloseReason, Launcher};
use nodelaunch_lib::progress::{LogSink, ProgressLog, WriterSink};
use nodelaunch_lib::provider::{credentials_from_config, LocalArtifacts, StaticDirectory};
use nodelaunch_lib::ssh::RusshConnector;

/// Base filter when RUST_LOG is unset
const DEFAULT_FILTER: &str = "nodelaunch=info,nodelaunch_lib=info,russh=warn";

/// Read size for the stdin pump
const STDIN_CHUNK: usize = 8192;

#[derive(Parser, Debug)]
#[command(
    name = "nodelaunch",
    version,
    about = "Bootstrap a fresh instance over SSH and attach to its agent"
)]
struct Cli {
    /// Launch configuration (defaults to <config dir>/nodelaunch/launch.json)
    #[arg(short, long, env = "NODELAUNCH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the target host from the configuration
    #[arg(long)]
    host: Option<String>,

    /// Local agent artifact, overrides agent.local_path
    #[arg(long)]
    agent: Option<PathBuf>,

    /// Append progress lines to this file as well
    #[arg(long)]
    progress_log: Option<PathBuf>,

    /// Print a starter configuration and exit
    #[arg(long)]
    print_default_config: bool,
}

fn init_logging() {
    // progress and diagnostics go to stderr; stdout belongs to the agent
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let config = LaunchConfig::new("10.0.0.5", "~/.ssh/id_rsa");
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_logging();

    let path = match cli.config {
        Some(path) => path,
        None => launch_config_file()?,
    };
    let mut config = LaunchConfig::load(&path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(host) = cli.host {
        config.target.host = host;
        config.validate().map_err(anyhow::Error::msg)?;
    }

    let agent_path = cli
        .agent
        .or_else(|| config.agent.local_path.as_ref().map(PathBuf::from))
        .context("no agent artifact: pass --agent or set agent.local_path")?;

    let launch_id = uuid::Uuid::new_v4().to_string();
    let log = match &cli.progress_log {
        Some(file) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .with_context(|| format!("opening {}", file.display()))?;
            let sink: Arc<dyn LogSink> = Arc::new(WriterSink::new(file));
            ProgressLog::with_sink(launch_id, sink)
        }
        None => ProgressLog::tracing_only(launch_id),
    };

    let connector = RusshConnector::new(config.host_key.verifier())
        .with_handshake_timeout(config.retry.handshake_timeout());
    let directory = StaticDirectory::from_config(&config);
    let credentials = credentials_from_config(&config.credentials);
    let artifacts = LocalArtifacts::new(agent_path, config.download_base_url.clone());

    let launcher = Launcher::new(
        Arc::new(config),
        Arc::new(connector),
        Arc::new(directory),
        Arc::from(credentials),
        Arc::new(artifacts),
    )
    .with_log(log);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
            on_signal.cancel();
        }
    });

    let channel = launcher.launch(&cancel).await?;
    let reason = bridge_stdio(channel, &cancel).await?;
    info!("Agent channel closed: {}", reason);
    Ok(())
}

/// Pump stdin into the agent and agent output to stdout.
async fn bridge_stdio(mut channel: AgentChannel, cancel: &CancellationToken) -> Result<CloseReason> {
    let writer = channel.writer();
    let pump = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; STDIN_CHUNK];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                channel.close();
                break;
            }
            chunk = channel.recv() => match chunk {
                Some(data) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
        }
    }

    pump.abort();
    Ok(channel.closed().await)
}
