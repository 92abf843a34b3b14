//! Saga-style workflow state machines.
//!
//! Each concrete workflow is one aggregate whose state code enumerates
//! every phase of a multi-party operation. Different daemons own different
//! phases and never call each other: each watches the workflow stream,
//! sees a checkpoint event written by another process, and reacts with its
//! own command. The seven workflows here are parallel instances of the
//! same pattern, differing only in their state/event vocabulary and
//! transition table.
//!
//! Rules every workflow enforces uniformly:
//!
//! - `init` is idempotent only while `Uninitialized`/`Initialized`, and
//!   only with byte-identical parameters; different parameters on a retry
//!   are a hard [`EngineError::NotIdempotent`] conflict.
//! - every `begin_x`/`commit_x` accepts being re-issued from the state it
//!   would produce (zero events) and rejects any other state.
//! - `abort` is accepted while a phase may still fail and is always an
//!   idempotent no-op once `Failed`, regardless of the code/message
//!   supplied, so a retrier racing another failure path never sees a
//!   confusing conflict.
//! - `end` only follows `Completed`/`Failed`; a missing terminal event is
//!   recoverable (retrying `end` is always safe), never corruption.
//! - `delete` is an error-free no-op from `Uninitialized`, the terminal
//!   states, and `Terminated`; it is rejected while in flight.
//! - `abort_expired` is usable from any in-flight state and belongs to the
//!   garbage collector alone.

pub mod archive;
pub mod du;
pub mod freeze;
pub mod ping;
pub mod split;
pub mod unarchive;
pub mod unfreeze;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::id::Vid;
use crate::journal::Journal;

/// The closed set of workflow types the index and GC operate over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    ArchiveRepo,
    UnarchiveRepo,
    FreezeRepo,
    UnfreezeRepo,
    PingRegistry,
    SplitRoot,
    DuRoot,
}

impl WorkflowKind {
    /// All kinds, for index buckets and GC scans.
    pub const ALL: [WorkflowKind; 7] = [
        WorkflowKind::ArchiveRepo,
        WorkflowKind::UnarchiveRepo,
        WorkflowKind::FreezeRepo,
        WorkflowKind::UnfreezeRepo,
        WorkflowKind::PingRegistry,
        WorkflowKind::SplitRoot,
        WorkflowKind::DuRoot,
    ];
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowKind::ArchiveRepo => "archive-repo",
            WorkflowKind::UnarchiveRepo => "unarchive-repo",
            WorkflowKind::FreezeRepo => "freeze-repo",
            WorkflowKind::UnfreezeRepo => "unfreeze-repo",
            WorkflowKind::PingRegistry => "ping-registry",
            WorkflowKind::SplitRoot => "split-root",
            WorkflowKind::DuRoot => "du-root",
        };
        f.write_str(name)
    }
}

/// One measured path, as recorded by the split-root and du-root workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuEntry {
    pub path: String,
    pub bytes: u64,
}

/// Coarse outcome classification of a finished workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// All phases committed.
    Success,
    /// A phase aborted.
    Failed,
    /// Force-terminated by the garbage collector after exceeding its
    /// max-active window.
    Expired,
}

/// Final status recorded on a workflow's `Failed`/`Completed` transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub code: StatusCode,
    pub message: String,
}

impl WorkflowStatus {
    /// The status a clean `commit` records.
    pub fn success() -> WorkflowStatus {
        WorkflowStatus {
            code: StatusCode::Success,
            message: String::new(),
        }
    }

    /// A failure with the aborting process's reason.
    pub fn failed(message: impl Into<String>) -> WorkflowStatus {
        WorkflowStatus {
            code: StatusCode::Failed,
            message: message.into(),
        }
    }

    /// The status the GC records when force-expiring a workflow.
    pub fn expired() -> WorkflowStatus {
        WorkflowStatus {
            code: StatusCode::Expired,
            message: "exceeded max-active window".into(),
        }
    }
}

/// Every workflow engine behind one dispatching surface.
///
/// The garbage collector and the index operate per [`WorkflowKind`]; this
/// bundle lets them issue the uniform `abort_expired`/`end`/`delete`
/// vocabulary without knowing each workflow's concrete types.
#[derive(Clone)]
pub struct WorkflowSet {
    pub archive: archive::ArchiveRepoWorkflows,
    pub unarchive: unarchive::UnarchiveRepoWorkflows,
    pub freeze: freeze::FreezeRepoWorkflows,
    pub unfreeze: unfreeze::UnfreezeRepoWorkflows,
    pub ping: ping::PingRegistryWorkflows,
    pub split: split::SplitRootWorkflows,
    pub du: du::DuRootWorkflows,
}

impl WorkflowSet {
    /// Bind every workflow type to the shared journal.
    pub fn new(journal: Journal) -> WorkflowSet {
        WorkflowSet {
            archive: archive::ArchiveRepoWorkflows::new(journal.clone()),
            unarchive: unarchive::UnarchiveRepoWorkflows::new(journal.clone()),
            freeze: freeze::FreezeRepoWorkflows::new(journal.clone()),
            unfreeze: unfreeze::UnfreezeRepoWorkflows::new(journal.clone()),
            ping: ping::PingRegistryWorkflows::new(journal.clone()),
            split: split::SplitRootWorkflows::new(journal.clone()),
            du: du::DuRootWorkflows::new(journal),
        }
    }

    /// Force-expire an in-flight workflow (GC only).
    pub fn abort_expired(&self, kind: WorkflowKind, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        match kind {
            WorkflowKind::ArchiveRepo => self.archive.abort_expired(id, vid),
            WorkflowKind::UnarchiveRepo => self.unarchive.abort_expired(id, vid),
            WorkflowKind::FreezeRepo => self.freeze.abort_expired(id, vid),
            WorkflowKind::UnfreezeRepo => self.unfreeze.abort_expired(id, vid),
            WorkflowKind::PingRegistry => self.ping.abort_expired(id, vid),
            WorkflowKind::SplitRoot => self.split.abort_expired(id, vid),
            WorkflowKind::DuRoot => self.du.abort_expired(id, vid),
        }
    }

    /// Write the closing terminal event.
    pub fn end(&self, kind: WorkflowKind, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        match kind {
            WorkflowKind::ArchiveRepo => self.archive.end(id, vid),
            WorkflowKind::UnarchiveRepo => self.unarchive.end(id, vid),
            WorkflowKind::FreezeRepo => self.freeze.end(id, vid),
            WorkflowKind::UnfreezeRepo => self.unfreeze.end(id, vid),
            WorkflowKind::PingRegistry => self.ping.end(id, vid),
            WorkflowKind::SplitRoot => self.split.end(id, vid),
            WorkflowKind::DuRoot => self.du.end(id, vid),
        }
    }

    /// Ask whether the workflow may be forgotten.
    pub fn delete(&self, kind: WorkflowKind, id: Uuid, vid: Vid) -> Result<(), EngineError> {
        match kind {
            WorkflowKind::ArchiveRepo => self.archive.delete(id, vid),
            WorkflowKind::UnarchiveRepo => self.unarchive.delete(id, vid),
            WorkflowKind::FreezeRepo => self.freeze.delete(id, vid),
            WorkflowKind::UnfreezeRepo => self.unfreeze.delete(id, vid),
            WorkflowKind::PingRegistry => self.ping.delete(id, vid),
            WorkflowKind::SplitRoot => self.split.delete(id, vid),
            WorkflowKind::DuRoot => self.du.delete(id, vid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&WorkflowKind::ArchiveRepo).unwrap();
        assert_eq!(json, r#""archive-repo""#);
        let back: WorkflowKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, WorkflowKind::ArchiveRepo);
    }

    #[test]
    fn display_matches_serde_tag() {
        for kind in WorkflowKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn status_constructors() {
        assert_eq!(WorkflowStatus::success().code, StatusCode::Success);
        let failed = WorkflowStatus::failed("tartt failed");
        assert_eq!(failed.code, StatusCode::Failed);
        assert_eq!(failed.message, "tartt failed");
        assert_eq!(WorkflowStatus::expired().code, StatusCode::Expired);
    }
}
