//! Archive-repo workflow: move a repository's files into cold storage.
//!
//! The longest choreography in the system, spanning three parties that
//! never call each other:
//!
//! 1. the initiating process writes `Started`;
//! 2. the registry-owning process reacts, marks the repo "archiving" in
//!    its own aggregates, and writes `FilesStarted`;
//! 3. the storage-executing process watches, builds the tartt archive
//!    (`TarttCompleted`), swaps the live directory for the archive stub
//!    (`SwapStarted` → `FilesCompleted`);
//! 4. the registry-owning process commits the file changes in the
//!    registry/repo aggregates (`FilesCommitted`) and completes the run;
//! 5. the initiator ends it.
//!
//! Every checkpoint is a separate event so a crashed party can resume from
//! exactly the phase it owns.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowStatus;
use crate::engine::{Behavior, Engine, Loaded};
use crate::error::EngineError;
use crate::id::Vid;
use crate::journal::Journal;

/// Immutable parameters fixed at `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRepoParams {
    /// Registry the repository belongs to.
    pub registry: Uuid,
    /// The repository being archived.
    pub repo: Uuid,
    /// Who requested the archive.
    pub author: String,
}

/// Phase codes of an archive-repo run, in choreography order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Uninitialized,
    Initialized,
    FilesInProgress,
    TarttCompleted,
    SwapInProgress,
    FilesCompleted,
    FilesCommitted,
    FilesFailed,
    Completed,
    Failed,
    Terminated,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Initialized => "initialized",
            Phase::FilesInProgress => "files-in-progress",
            Phase::TarttCompleted => "tartt-completed",
            Phase::SwapInProgress => "swap-in-progress",
            Phase::FilesCompleted => "files-completed",
            Phase::FilesCommitted => "files-committed",
            Phase::FilesFailed => "files-failed",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Terminated => "terminated",
        }
    }

    fn is_in_flight(self) -> bool {
        !matches!(
            self,
            Phase::Uninitialized | Phase::Completed | Phase::Failed | Phase::Terminated
        )
    }
}

/// Projection of one archive-repo stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRepoWorkflow {
    pub phase: Phase,
    pub params: Option<ArchiveRepoParams>,
    /// Final status once `Completed`/`Failed` is reached.
    pub status: Option<WorkflowStatus>,
}

/// Checkpoint events of an archive-repo run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ArchiveRepoEvent {
    Started { params: ArchiveRepoParams },
    FilesStarted,
    TarttCompleted,
    SwapStarted,
    FilesCompleted,
    FilesCommitted,
    FilesFailed { status: WorkflowStatus },
    Completed,
    Failed { status: WorkflowStatus },
    Terminated,
}

/// Commands of an archive-repo run.
#[derive(Debug, Clone)]
pub enum ArchiveRepoCommand {
    Init { params: ArchiveRepoParams },
    BeginFiles,
    CommitTartt,
    BeginSwap,
    CommitFiles,
    CommitFileChanges,
    AbortFiles { status: WorkflowStatus },
    Commit,
    Abort { status: WorkflowStatus },
    End,
    Delete,
    AbortExpired,
}

pub struct ArchiveRepoBehavior;

impl Behavior for ArchiveRepoBehavior {
    const AGGREGATE_TYPE: &'static str = "archive-repo";
    type State = ArchiveRepoWorkflow;
    type Event = ArchiveRepoEvent;
    type Command = ArchiveRepoCommand;

    fn tell(
        state: &ArchiveRepoWorkflow,
        cmd: ArchiveRepoCommand,
    ) -> Result<Vec<ArchiveRepoEvent>, EngineError> {
        use ArchiveRepoCommand as C;
        use ArchiveRepoEvent as E;
        use Phase as P;

        match cmd {
            C::Init { params } => match state.phase {
                P::Uninitialized => Ok(vec![E::Started { params }]),
                P::Initialized => {
                    let stored = state
                        .params
                        .as_ref()
                        .expect("initialized workflow always stores params");
                    if *stored == params {
                        Ok(vec![])
                    } else {
                        Err(EngineError::NotIdempotent {
                            command: "init",
                            detail: format!(
                                "stored params for repo {} do not match retry",
                                stored.repo
                            ),
                        })
                    }
                }
                phase => Err(conflict("init", phase)),
            },

            C::BeginFiles => match state.phase {
                P::Initialized => Ok(vec![E::FilesStarted]),
                P::FilesInProgress => Ok(vec![]),
                P::Uninitialized => Err(EngineError::Uninitialized(Uuid::nil())),
                phase => Err(conflict("begin-files", phase)),
            },

            C::CommitTartt => match state.phase {
                P::FilesInProgress => Ok(vec![E::TarttCompleted]),
                P::TarttCompleted => Ok(vec![]),
                phase => Err(conflict("commit-tartt", phase)),
            },

            C::BeginSwap => match state.phase {
                P::TarttCompleted => Ok(vec![E::SwapStarted]),
                P::SwapInProgress => Ok(vec![]),
                phase => Err(conflict("begin-swap", phase)),
            },

            C::CommitFiles => match state.phase {
                P::SwapInProgress => Ok(vec![E::FilesCompleted]),
                P::FilesCompleted => Ok(vec![]),
                phase => Err(conflict("commit-files", phase)),
            },

            C::CommitFileChanges => match state.phase {
                P::FilesCompleted => Ok(vec![E::FilesCommitted]),
                P::FilesCommitted => Ok(vec![]),
                phase => Err(conflict("commit-file-changes", phase)),
            },

            C::AbortFiles { status } => match state.phase {
                P::FilesInProgress | P::TarttCompleted | P::SwapInProgress => {
                    Ok(vec![E::FilesFailed { status }])
                }
                // Idempotent regardless of the status supplied on the retry.
                P::FilesFailed => Ok(vec![]),
                phase => Err(conflict("abort-files", phase)),
            },

            C::Commit => match state.phase {
                P::FilesCommitted => Ok(vec![E::Completed]),
                P::Completed => Ok(vec![]),
                phase => Err(conflict("commit", phase)),
            },

            C::Abort { status } => match state.phase {
                phase if phase.is_in_flight() => Ok(vec![E::Failed { status }]),
                // Always idempotent once failed, whatever the retried
                // code/message says.
                P::Failed => Ok(vec![]),
                P::Uninitialized => Err(EngineError::Uninitialized(Uuid::nil())),
                P::Terminated => Err(EngineError::AlreadyTerminated(Uuid::nil())),
                phase => Err(conflict("abort", phase)),
            },

            C::End => match state.phase {
                P::Completed | P::Failed => Ok(vec![E::Terminated]),
                P::Terminated => Ok(vec![]),
                phase => Err(conflict("end", phase)),
            },

            C::Delete => match state.phase {
                P::Uninitialized | P::Completed | P::Failed | P::Terminated => Ok(vec![]),
                phase => Err(conflict("delete", phase)),
            },

            C::AbortExpired => match state.phase {
                phase if phase.is_in_flight() => Ok(vec![E::Failed {
                    status: WorkflowStatus::expired(),
                }]),
                P::Failed | P::Terminated => Ok(vec![]),
                phase => Err(conflict("abort-expired", phase)),
            },
        }
    }

    fn advance(mut state: ArchiveRepoWorkflow, event: &ArchiveRepoEvent) -> ArchiveRepoWorkflow {
        use ArchiveRepoEvent as E;
        match event {
            E::Started { params } => {
                state.phase = Phase::Initialized;
                state.params = Some(params.clone());
            }
            E::FilesStarted => state.phase = Phase::FilesInProgress,
            E::TarttCompleted => state.phase = Phase::TarttCompleted,
            E::SwapStarted => state.phase = Phase::SwapInProgress,
            E::FilesCompleted => state.phase = Phase::FilesCompleted,
            E::FilesCommitted => state.phase = Phase::FilesCommitted,
            E::FilesFailed { status } => {
                state.phase = Phase::FilesFailed;
                state.status = Some(status.clone());
            }
            E::Completed => {
                state.phase = Phase::Completed;
                state.status = Some(WorkflowStatus::success());
            }
            E::Failed { status } => {
                state.phase = Phase::Failed;
                state.status = Some(status.clone());
            }
            E::Terminated => state.phase = Phase::Terminated,
        }
        state
    }
}

fn conflict(command: &'static str, phase: Phase) -> EngineError {
    EngineError::StateConflict {
        command,
        state: phase.name(),
    }
}

/// Typed wrapper exposing the archive-repo vocabulary over the engine.
#[derive(Clone)]
pub struct ArchiveRepoWorkflows {
    engine: Engine<ArchiveRepoBehavior>,
}

impl ArchiveRepoWorkflows {
    pub fn new(journal: Journal) -> ArchiveRepoWorkflows {
        ArchiveRepoWorkflows {
            engine: Engine::new(journal),
        }
    }

    pub fn find(&self, id: Uuid) -> Result<Loaded<ArchiveRepoWorkflow>, EngineError> {
        self.engine.find_id(id)
    }

    pub fn init(&self, id: Uuid, vid: Vid, params: ArchiveRepoParams) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, ArchiveRepoCommand::Init { params })
    }

    pub fn begin_files(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, ArchiveRepoCommand::BeginFiles)
    }

    pub fn commit_tartt(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, ArchiveRepoCommand::CommitTartt)
    }

    pub fn begin_swap(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, ArchiveRepoCommand::BeginSwap)
    }

    pub fn commit_files(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, ArchiveRepoCommand::CommitFiles)
    }

    pub fn commit_file_changes(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, ArchiveRepoCommand::CommitFileChanges)
    }

    pub fn abort_files(
        &self,
        id: Uuid,
        vid: Vid,
        status: WorkflowStatus,
    ) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, ArchiveRepoCommand::AbortFiles { status })
    }

    pub fn commit(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, ArchiveRepoCommand::Commit)
    }

    pub fn abort(&self, id: Uuid, vid: Vid, status: WorkflowStatus) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, ArchiveRepoCommand::Abort { status })
    }

    pub fn end(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, ArchiveRepoCommand::End)
    }

    pub fn delete(&self, id: Uuid, vid: Vid) -> Result<(), EngineError> {
        self.engine
            .delete_id_vid(id, vid, ArchiveRepoCommand::Delete)
    }

    pub fn abort_expired(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, ArchiveRepoCommand::AbortExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{workflow_id, EventId};
    use crate::workflows::StatusCode;

    fn params() -> ArchiveRepoParams {
        ArchiveRepoParams {
            registry: Uuid::new_v4(),
            repo: Uuid::new_v4(),
            author: "alice".into(),
        }
    }

    fn workflows() -> ArchiveRepoWorkflows {
        ArchiveRepoWorkflows::new(Journal::new())
    }

    #[test]
    fn full_choreography_reaches_terminated() {
        let wf = workflows();
        let id = workflow_id();

        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf.commit_tartt(id, v).unwrap();
        let v = wf.begin_swap(id, v).unwrap();
        let v = wf.commit_files(id, v).unwrap();
        let v = wf.commit_file_changes(id, v).unwrap();
        let v = wf.commit(id, v).unwrap();
        wf.end(id, v).unwrap();

        let loaded = wf.find(id).unwrap();
        assert_eq!(loaded.state.phase, Phase::Terminated);
        assert_eq!(loaded.state.status.as_ref().unwrap().code, StatusCode::Success);
    }

    #[test]
    fn phases_must_advance_in_choreography_order() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();

        // The swap cannot start before the tartt archive exists.
        let err = wf.begin_swap(id, v).expect_err("tartt not yet built");
        assert!(matches!(err, EngineError::StateConflict { .. }));
        // Neither can the registry commit file changes.
        let err = wf
            .commit_file_changes(id, v)
            .expect_err("files not yet completed");
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }

    #[test]
    fn each_checkpoint_is_idempotent_from_its_target_state() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf.commit_tartt(id, v).unwrap();
        assert_eq!(wf.commit_tartt(id, v).unwrap(), v);
        let v = wf.begin_swap(id, v).unwrap();
        assert_eq!(wf.begin_swap(id, v).unwrap(), v);
        let v = wf.commit_files(id, v).unwrap();
        assert_eq!(wf.commit_files(id, v).unwrap(), v);
    }

    #[test]
    fn files_failure_mid_swap_propagates() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf.commit_tartt(id, v).unwrap();
        let v = wf.begin_swap(id, v).unwrap();

        let v = wf
            .abort_files(id, v, WorkflowStatus::failed("swap interrupted"))
            .unwrap();
        let v = wf
            .abort(id, v, WorkflowStatus::failed("swap interrupted"))
            .unwrap();
        wf.end(id, v).unwrap();

        let loaded = wf.find(id).unwrap();
        assert_eq!(loaded.state.phase, Phase::Terminated);
        assert_eq!(
            loaded.state.status.as_ref().unwrap().message,
            "swap interrupted"
        );
    }

    #[test]
    fn abort_expired_works_from_deep_in_the_choreography() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf.commit_tartt(id, v).unwrap();
        wf.begin_swap(id, v).unwrap();

        wf.abort_expired(id, EventId::RETRY_NO_VC).unwrap();
        let loaded = wf.find(id).unwrap();
        assert_eq!(loaded.state.phase, Phase::Failed);
        assert_eq!(loaded.state.status.as_ref().unwrap().code, StatusCode::Expired);
    }

    #[test]
    fn init_conflict_on_reused_identity() {
        let wf = workflows();
        let id = workflow_id();
        wf.init(id, EventId::EPOCH, params()).unwrap();

        let err = wf
            .init(id, EventId::NO_VC, params())
            .expect_err("different repo under the same workflow id");
        assert!(matches!(err, EngineError::NotIdempotent { .. }));
    }
}
