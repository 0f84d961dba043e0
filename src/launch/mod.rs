//! Node Launch Module
//!
//! The bootstrap protocol itself: connect with retry, negotiate the
//! privileged account, provision the node and hand the agent's channel back
//! to the caller.

mod connector;
mod error;
mod exec;
mod handoff;
mod launcher;
mod negotiate;
mod provision;
mod state;

pub use connector::connect_with_retry;
pub use error::BootstrapError;
pub use exec::{run_command, run_pty_command, wait_completion, ExitStatus, OutputMode};
pub use handoff::{AgentChannel, AgentWriter, CloseReason, HandoffError};
pub use launcher::Launcher;
pub use negotiate::{authenticate_privileged, escalation_command, negotiate, Negotiated};
pub use provision::{
    init_marker_path, install_command, launch_command, InitOutcome, Provisioner, RuntimeOutcome,
    AGENT_REMOTE_DIR, INIT_MARKER_DIR, INIT_MARKER_NAME, INIT_SCRIPT_DIR, INIT_SCRIPT_NAME,
};
pub use state::{Account, BootstrapState, BootstrapStateMachine, StateTransitionError};
