//! SSH Transport Module
//!
//! Object-safe transport traits used by the bootstrap sequence, host key
//! verification strategies, and the russh implementation behind them.

mod client;
mod error;
mod host_key;
mod transport;

pub use client::{RusshConnector, RusshSession};
pub use error::TransportError;
pub use host_key::{
    AcceptAnyHostKey, HostKeyPolicy, HostKeyVerifier, PinnedFingerprints, PresentedHostKey,
};
pub use transport::{ChannelEvent, Connector, ExecChannel, RemoteSession};
