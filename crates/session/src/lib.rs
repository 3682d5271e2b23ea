//! Per-session state for the ingestion server.
//!
//! The [`SessionManager`] owns everything a live session holds: the typed
//! resource map, the active-session set, the per-session task scope, and the
//! transcript coalescer feeding the analysis queue. Audio consumers and the
//! signaling layer only ever touch session state through a
//! [`SessionContext`] handle.

pub mod coalesce;
mod consumer;
mod ids;
mod key;
pub mod keys;
mod manager;

pub use coalesce::{CoalescerConfig, TextCoalescer};
pub use consumer::{AudioConsumer, ConsumerError};
pub use ids::{AnalysisId, ProjectId, SessionId, TranscriptId, UserId};
pub use key::ResourceKey;
pub use manager::{AIJob, SessionContext, SessionData, SessionManager};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Operation on a session that was never created or already torn down.
    #[error("session {0} is not active")]
    NotActive(SessionId),
    /// Second `register` for the same (session, key). Programmer error.
    #[error("resource `{key}` already registered for session {session_id}")]
    AlreadyRegistered {
        session_id: SessionId,
        key: &'static str,
    },
    /// A `get_or_wait` was interrupted by session teardown.
    #[error("session {0} was torn down while waiting")]
    TornDown(SessionId),
    /// A key's registered value has a different type than the key promises.
    /// Programmer error: two keys with the same name but different types.
    #[error("resource `{key}` holds a value of an unexpected type")]
    TypeMismatch { key: &'static str },
    /// The analysis job queue is gone (worker pool stopped).
    #[error("analysis job queue is closed")]
    AnalysisQueueClosed,
}

pub type Result<T> = std::result::Result<T, SessionError>;
