//! Unarchive-repo workflow: restore an archived repository's files.
//!
//! Mirror of [`crate::workflows::archive`], run in reverse: the storage
//! process unpacks the tartt archive (`TarttStarted` → `TarttCompleted`)
//! back into a live directory, then the registry-owning process commits
//! the restored file state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowStatus;
use crate::engine::{Behavior, Engine, Loaded};
use crate::error::EngineError;
use crate::id::Vid;
use crate::journal::Journal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnarchiveRepoParams {
    pub registry: Uuid,
    pub repo: Uuid,
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Uninitialized,
    Initialized,
    FilesInProgress,
    TarttInProgress,
    TarttCompleted,
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
            Phase::TarttInProgress => "tartt-in-progress",
            Phase::TarttCompleted => "tartt-completed",
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

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnarchiveRepoWorkflow {
    pub phase: Phase,
    pub params: Option<UnarchiveRepoParams>,
    pub status: Option<WorkflowStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UnarchiveRepoEvent {
    Started { params: UnarchiveRepoParams },
    FilesStarted,
    TarttStarted,
    TarttCompleted,
    FilesCompleted,
    FilesCommitted,
    FilesFailed { status: WorkflowStatus },
    Completed,
    Failed { status: WorkflowStatus },
    Terminated,
}

#[derive(Debug, Clone)]
pub enum UnarchiveRepoCommand {
    Init { params: UnarchiveRepoParams },
    BeginFiles,
    BeginTartt,
    CommitTartt,
    CommitFiles,
    CommitFileChanges,
    AbortFiles { status: WorkflowStatus },
    Commit,
    Abort { status: WorkflowStatus },
    End,
    Delete,
    AbortExpired,
}

pub struct UnarchiveRepoBehavior;

impl Behavior for UnarchiveRepoBehavior {
    const AGGREGATE_TYPE: &'static str = "unarchive-repo";
    type State = UnarchiveRepoWorkflow;
    type Event = UnarchiveRepoEvent;
    type Command = UnarchiveRepoCommand;

    fn tell(
        state: &UnarchiveRepoWorkflow,
        cmd: UnarchiveRepoCommand,
    ) -> Result<Vec<UnarchiveRepoEvent>, EngineError> {
        use Phase as P;
        use UnarchiveRepoCommand as C;
        use UnarchiveRepoEvent as E;

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
            C::BeginTartt => match state.phase {
                P::FilesInProgress => Ok(vec![E::TarttStarted]),
                P::TarttInProgress => Ok(vec![]),
                phase => Err(conflict("begin-tartt", phase)),
            },
            C::CommitTartt => match state.phase {
                P::TarttInProgress => Ok(vec![E::TarttCompleted]),
                P::TarttCompleted => Ok(vec![]),
                phase => Err(conflict("commit-tartt", phase)),
            },
            C::CommitFiles => match state.phase {
                P::TarttCompleted => Ok(vec![E::FilesCompleted]),
                P::FilesCompleted => Ok(vec![]),
                phase => Err(conflict("commit-files", phase)),
            },
            C::CommitFileChanges => match state.phase {
                P::FilesCompleted => Ok(vec![E::FilesCommitted]),
                P::FilesCommitted => Ok(vec![]),
                phase => Err(conflict("commit-file-changes", phase)),
            },
            C::AbortFiles { status } => match state.phase {
                P::FilesInProgress | P::TarttInProgress | P::TarttCompleted => {
                    Ok(vec![E::FilesFailed { status }])
                }
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

    fn advance(
        mut state: UnarchiveRepoWorkflow,
        event: &UnarchiveRepoEvent,
    ) -> UnarchiveRepoWorkflow {
        use UnarchiveRepoEvent as E;
        match event {
            E::Started { params } => {
                state.phase = Phase::Initialized;
                state.params = Some(params.clone());
            }
            E::FilesStarted => state.phase = Phase::FilesInProgress,
            E::TarttStarted => state.phase = Phase::TarttInProgress,
            E::TarttCompleted => state.phase = Phase::TarttCompleted,
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

/// Typed wrapper exposing the unarchive-repo vocabulary over the engine.
#[derive(Clone)]
pub struct UnarchiveRepoWorkflows {
    engine: Engine<UnarchiveRepoBehavior>,
}

impl UnarchiveRepoWorkflows {
    pub fn new(journal: Journal) -> UnarchiveRepoWorkflows {
        UnarchiveRepoWorkflows {
            engine: Engine::new(journal),
        }
    }

    pub fn find(&self, id: Uuid) -> Result<Loaded<UnarchiveRepoWorkflow>, EngineError> {
        self.engine.find_id(id)
    }

    pub fn init(
        &self,
        id: Uuid,
        vid: Vid,
        params: UnarchiveRepoParams,
    ) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnarchiveRepoCommand::Init { params })
    }

    pub fn begin_files(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnarchiveRepoCommand::BeginFiles)
    }

    pub fn begin_tartt(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnarchiveRepoCommand::BeginTartt)
    }

    pub fn commit_tartt(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnarchiveRepoCommand::CommitTartt)
    }

    pub fn commit_files(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnarchiveRepoCommand::CommitFiles)
    }

    pub fn commit_file_changes(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnarchiveRepoCommand::CommitFileChanges)
    }

    pub fn abort_files(
        &self,
        id: Uuid,
        vid: Vid,
        status: WorkflowStatus,
    ) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnarchiveRepoCommand::AbortFiles { status })
    }

    pub fn commit(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnarchiveRepoCommand::Commit)
    }

    pub fn abort(&self, id: Uuid, vid: Vid, status: WorkflowStatus) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnarchiveRepoCommand::Abort { status })
    }

    pub fn end(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, UnarchiveRepoCommand::End)
    }

    pub fn delete(&self, id: Uuid, vid: Vid) -> Result<(), EngineError> {
        self.engine
            .delete_id_vid(id, vid, UnarchiveRepoCommand::Delete)
    }

    pub fn abort_expired(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnarchiveRepoCommand::AbortExpired)
    }
}
