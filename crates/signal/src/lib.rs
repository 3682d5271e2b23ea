//! Signaling wire protocol and the concurrency-safe outbound socket.
//!
//! Every frame on the wire is a JSON envelope `{"message": {...}}` whose
//! inner object carries a `type` discriminator and an ISO-8601 timestamp.
//! The [`OutboundSocket`] serializes sends from arbitrary session tasks
//! through one writer so frames never interleave.

mod ice;
mod messages;
mod outbound;

pub use ice::{parse_candidate, CandidateFields};
pub use messages::{Envelope, IceCandidateInit, SessionDescription, WireMessage};
pub use outbound::{MessageTransport, OutboundSocket};

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// `send` after `close`, or the writer task is gone.
    #[error("outbound socket is closed")]
    Closed,
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed ICE candidate: {0}")]
    MalformedCandidate(String),
}

pub type Result<T> = std::result::Result<T, SignalError>;
