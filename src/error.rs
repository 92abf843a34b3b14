//! Crate-level error types for the journal and the aggregate engine.
//!
//! Domain errors (the engine's first eight variants) mean "this command will
//! never succeed as issued" and are returned to the caller without retry.
//! [`JournalError`] variants other than the version conflict are
//! infrastructure failures where a retry might help; the two families are
//! kept distinguishable so callers can tell them apart.

use crate::id::Vid;
use uuid::Uuid;

/// Error returned by journal operations.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Optimistic concurrency check failed on append.
    ///
    /// The stream's tail did not equal the expected parent vid. The caller
    /// must reload and retry with a fresh vid.
    #[error("version conflict on stream {stream}: expected tail {expected}, found {actual}")]
    VersionConflict {
        /// The stream that rejected the append.
        stream: Uuid,
        /// The parent vid the writer expected.
        expected: Vid,
        /// The stream's actual tail at append time.
        actual: Vid,
    },

    /// The journal has been shut down and no longer accepts operations.
    #[error("journal is closed")]
    Closed,

    /// Underlying storage or transport failure. Retry might help.
    #[error("journal storage failure: {0}")]
    Storage(String),
}

impl JournalError {
    /// Whether a retry of the failed operation could plausibly succeed
    /// without the caller changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JournalError::Storage(_))
    }
}

/// Error returned when loading state or applying a command via the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The operation requires a prior `Init` on this aggregate.
    #[error("aggregate {0} is uninitialized")]
    Uninitialized(Uuid),

    /// The command is invalid for the aggregate's current phase.
    #[error("state conflict: cannot {command} while {state}")]
    StateConflict {
        /// Human-readable name of the rejected command.
        command: &'static str,
        /// Human-readable name of the current state code.
        state: &'static str,
    },

    /// A retried command's arguments disagree with what was already recorded.
    ///
    /// Distinguishes "harmless retry" (zero events, no error) from "caller
    /// reused an identity for a different logical run" (hard conflict).
    #[error("not idempotent: retried {command} with conflicting arguments: {detail}")]
    NotIdempotent {
        /// Human-readable name of the retried command.
        command: &'static str,
        /// Which argument disagreed, and how.
        detail: String,
    },

    /// The aggregate's history is closed; no further transitions exist.
    #[error("aggregate {0} is already terminated")]
    AlreadyTerminated(Uuid),

    /// Optimistic concurrency lost: the caller's vid is stale.
    #[error("version conflict: expected vid {expected}, current vid {actual}")]
    VersionConflict {
        /// The vid the caller presented.
        expected: Vid,
        /// The stream's current vid.
        actual: Vid,
    },

    /// An identity was required to exist but has no history.
    #[error("unknown workflow or aggregate {0}")]
    UnknownWorkflow(Uuid),

    /// A bounded accumulation would exceed its configured cap.
    ///
    /// No event is written for the rejected call.
    #[error("resource exhausted: {what} would exceed cap of {limit}")]
    ResourceExhausted {
        /// What was being accumulated (du paths, suggestions, indexed workflows).
        what: &'static str,
        /// The configured cap.
        limit: usize,
    },

    /// A requested index snapshot is not worth taking right now.
    ///
    /// Benign: callers (the GC) log it at debug level and move on.
    #[error("snapshot skipped: {0}")]
    SnapshotSkipped(String),

    /// An event in the stream could not be decoded for this aggregate type.
    ///
    /// A foreign or corrupt event kind in a stream is a programming error,
    /// not a forward-compatibility concern; it is surfaced at load time
    /// rather than silently skipped.
    #[error("undecodable event {id} on stream {stream}: {detail}")]
    BadEvent {
        /// The stream being replayed.
        stream: Uuid,
        /// The offending event's id.
        id: Vid,
        /// The decode failure.
        detail: String,
    },

    /// Underlying journal failure, passed through unchanged.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl EngineError {
    /// Whether this error is benign for an idempotent retry loop.
    ///
    /// `RETRY_NO_VC` callers treat these as "someone else already did it":
    /// a version conflict will resolve itself on the next scan, and a
    /// skipped snapshot is an explicit "not worth it".
    pub fn is_benign_for_retry(&self) -> bool {
        matches!(
            self,
            EngineError::VersionConflict { .. } | EngineError::SnapshotSkipped(_)
        )
    }
}
