//! Delivery dispatcher and command protocol for the Beacon agent.
//!
//! The dispatcher drives the store→transport draining loop on a fixed
//! tick: certificate gate, stale-claim reclaim, then the transport's
//! drain shape (one claimed batch for HTTP, per-sample acknowledged
//! publishes for pub/sub). The command handler decodes the binary frames
//! arriving over the pub/sub link and mutates configuration through the
//! store.

mod command;
mod dispatcher;

pub use command::{
    parse_frame, CommandFrame, CommandHandler, CommandResponse, ProtocolError, SystemControl,
    CMD_CONFIG_READ, CMD_CONFIG_WRITE, CMD_REBOOT, TAG_DOUBLE, TAG_INT, TAG_INT64, TAG_STRING,
};
pub use dispatcher::{run_command_loop, DispatchConfig, Dispatcher, IdentityGate};

use thiserror::Error;

/// Dispatch error type; every variant is recovered within the cycle.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] beacon_store::StoreError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] beacon_transport::TransportError),

    /// Identity error
    #[error("Identity error: {0}")]
    Identity(#[from] beacon_identity::IdentityError),

    /// Malformed command frame
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type alias using DispatchError.
pub type DispatchResult<T> = Result<T, DispatchError>;
