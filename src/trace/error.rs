//! Error types for trace operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a trace before any probe is sent.
///
/// Once probing has started, failures are recorded per-probe (see
/// [`ProbeError`]) and never abort the trace.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The target has neither an IPv4 nor an IPv6 address
    #[error("unable to resolve destination host: {0}")]
    Resolution(String),

    /// Raw socket open or configuration failed
    ///
    /// Opening raw ICMP sockets requires elevated privilege on most
    /// systems; the underlying OS error is carried unmodified.
    #[error("failed to open raw ICMP socket: {0}")]
    Transport(#[from] std::io::Error),

    /// The probe message could not be marshalled at trace setup
    #[error(transparent)]
    Encode(#[from] ProbeError),
}

/// A failure captured at probe time and stored in the offending
/// [`Hop`](crate::Hop).
///
/// Per-probe errors aggregate as `lost` and never abort a running trace.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ProbeError {
    /// ICMP message marshalling failed
    #[error("failed to encode probe: {0}")]
    Encode(String),

    /// Sending the probe (or configuring the socket for it) failed
    #[error("failed to send probe: {0}")]
    Send(String),

    /// Reading a reply failed with a non-timeout error
    #[error("failed to read reply: {0}")]
    Read(String),
}
