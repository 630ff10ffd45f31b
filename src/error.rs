//! Error types for the session orchestrator

use thiserror::Error;

/// Session orchestration error types.
///
/// Nothing here is fatal to the process: every failure is scoped to the
/// session it occurred in and reported outward. The orchestrator performs
/// no automatic retries; the caller decides whether to re-attempt.
#[derive(Debug, Error)]
pub enum Error {
    /// A correlated completion carried an error instead of a success payload
    #[error("Negotiation failed for {op}: {detail}")]
    Negotiation { op: &'static str, detail: String },

    /// Local media capture failed; user-visible, never aborts teardown
    #[error("Device capture failed: {0}")]
    Device(String),

    /// A correlated request received no matching completion in time
    #[error("Request timed out: {op}")]
    Timeout { op: &'static str },

    /// The signaling channel is gone; no further requests can be sent
    #[error("Signaling channel closed")]
    SignalingClosed,

    /// An operation required a transport that does not exist or is closed
    #[error("Transport not available")]
    TransportUnavailable,

    /// A programming-contract violation, e.g. building a second transport
    /// for a direction or overlapping produce negotiations
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// The media engine rejected an operation
    #[error("Engine error: {0}")]
    Engine(String),
}

/// Result type for session orchestration operations
pub type Result<T> = std::result::Result<T, Error>;
