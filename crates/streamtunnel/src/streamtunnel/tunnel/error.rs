use std::time::Duration;

use thiserror::Error;

use crate::streamtunnel::tunnel::{control::ControlError, mux::MuxConfigError};

/// Failures surfaced by the tunnel client.
///
/// Everything except `LocalDial` and per-session `Open` failures is terminal for
/// [`Client::start`](super::client::Client::start).
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("dial {addr}: {err}")]
    Dial { addr: String, err: std::io::Error },

    #[error("CONNECT {0}")]
    Connect(String),

    #[error("proxy server: {status}. err: {body}")]
    Rejected { status: String, body: String },

    #[error("invalid multiplexer config: {0}")]
    Config(#[from] MuxConfigError),

    #[error("timeout opening session after {}", humantime::format_duration(*.0))]
    OpenTimeout(Duration),

    #[error("session open: {0:#}")]
    Open(anyhow::Error),

    #[error("handshake aborted. got: {got}")]
    Handshake { got: String },

    #[error("decode err: {0}")]
    Decode(#[from] ControlError),

    #[error("dial local {addr}: {err}")]
    LocalDial { addr: String, err: std::io::Error },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
