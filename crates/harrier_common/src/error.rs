use thiserror::Error;

use crate::types::PhaseId;

/// Convenience alias for `Result<T, HarrierError>`.
pub type HarrierResult<T> = Result<T, HarrierError>;

/// Error classification for escalation and test assertions.
///
/// - `UserError`          — bad input (unknown schema/relation)
/// - `ProtocolViolation`  — duplicate bucket/searcher, illegal state; a
///                          programming error on the caller side
/// - `Cancellation`       — the job was killed
/// - `Upstream`           — a peer reported a failure into this phase
/// - `Downstream`         — the consumer failed while accepting rows
/// - `Transient`          — backpressure/rejection; retry may succeed
/// - `InternalBug`        — should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    ProtocolViolation,
    Cancellation,
    Upstream,
    Downstream,
    Transient,
    InternalBug,
}

/// Top-level error type of the collect execution core.
///
/// `Clone` on purpose: a single terminal cause is shared between the
/// processing future, the loading-page future, stashed listeners and the
/// batch iterator's kill switch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HarrierError {
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Job killed{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    JobKilled { reason: Option<String> },

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Downstream failure: {0}")]
    Downstream(String),

    /// A bounded pool could not accept more work.
    #[error("Rejected: pool '{pool}' cannot accept more work")]
    Rejected { pool: String },

    #[error("Memory pressure: phase uses {used_bytes} bytes, limit is {limit_bytes}")]
    MemoryPressure { used_bytes: u64, limit_bytes: u64 },

    #[error("Schema '{0}' unknown")]
    SchemaUnknown(String),

    #[error("Relation '{0}' unknown")]
    RelationUnknown(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Violations of the paging / lifecycle protocol. These are programming
/// errors of the caller, not runtime conditions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("same bucket of a page set more than once. node={node} phase_id={phase_id} bucket={bucket}")]
    DuplicateBucket {
        node: String,
        phase_id: PhaseId,
        bucket: usize,
    },

    #[error("searcher for {searcher} already added")]
    DuplicateSearcher { searcher: usize },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("truncated value: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },
}

impl HarrierError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarrierError::Protocol(_) => ErrorKind::ProtocolViolation,
            HarrierError::JobKilled { .. } => ErrorKind::Cancellation,
            HarrierError::Upstream(_) => ErrorKind::Upstream,
            HarrierError::Downstream(_) => ErrorKind::Downstream,
            HarrierError::Rejected { .. } => ErrorKind::Transient,
            HarrierError::MemoryPressure { .. } => ErrorKind::Transient,
            HarrierError::SchemaUnknown(_) | HarrierError::RelationUnknown(_) => ErrorKind::UserError,
            HarrierError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.kind(), ErrorKind::ProtocolViolation)
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancellation)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// The default cause supplied when a kill arrives without one.
    pub fn job_killed() -> Self {
        HarrierError::JobKilled { reason: None }
    }

    pub fn job_killed_with(reason: impl Into<String>) -> Self {
        HarrierError::JobKilled {
            reason: Some(reason.into()),
        }
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        HarrierError::Protocol(ProtocolError::IllegalState(msg.into()))
    }
}
