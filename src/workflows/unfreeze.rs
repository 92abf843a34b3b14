//! Unfreeze-repo workflow: make a frozen repository writable again.
//!
//! Mirror of [`crate::workflows::freeze`]: one files phase owned by the
//! repository-owning process, bracketed by the initiator's init/commit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowStatus;
use crate::engine::{Behavior, Engine, Loaded};
use crate::error::EngineError;
use crate::id::Vid;
use crate::journal::Journal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfreezeRepoParams {
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
    FilesCompleted,
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
            Phase::FilesCompleted => "files-completed",
            Phase::FilesFailed => "files-failed",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnfreezeRepoWorkflow {
    pub phase: Phase,
    pub params: Option<UnfreezeRepoParams>,
    pub status: Option<WorkflowStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UnfreezeRepoEvent {
    Started { params: UnfreezeRepoParams },
    FilesStarted,
    FilesCompleted,
    FilesFailed { status: WorkflowStatus },
    Completed,
    Failed { status: WorkflowStatus },
    Terminated,
}

#[derive(Debug, Clone)]
pub enum UnfreezeRepoCommand {
    Init { params: UnfreezeRepoParams },
    BeginFiles,
    CommitFiles,
    AbortFiles { status: WorkflowStatus },
    Commit,
    Abort { status: WorkflowStatus },
    End,
    Delete,
    AbortExpired,
}

pub struct UnfreezeRepoBehavior;

impl Behavior for UnfreezeRepoBehavior {
    const AGGREGATE_TYPE: &'static str = "unfreeze-repo";
    type State = UnfreezeRepoWorkflow;
    type Event = UnfreezeRepoEvent;
    type Command = UnfreezeRepoCommand;

    fn tell(
        state: &UnfreezeRepoWorkflow,
        cmd: UnfreezeRepoCommand,
    ) -> Result<Vec<UnfreezeRepoEvent>, EngineError> {
        use Phase as P;
        use UnfreezeRepoCommand as C;
        use UnfreezeRepoEvent as E;

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
            C::CommitFiles => match state.phase {
                P::FilesInProgress => Ok(vec![E::FilesCompleted]),
                P::FilesCompleted => Ok(vec![]),
                phase => Err(conflict("commit-files", phase)),
            },
            C::AbortFiles { status } => match state.phase {
                P::FilesInProgress => Ok(vec![E::FilesFailed { status }]),
                P::FilesFailed => Ok(vec![]),
                phase => Err(conflict("abort-files", phase)),
            },
            C::Commit => match state.phase {
                P::FilesCompleted => Ok(vec![E::Completed]),
                P::Completed => Ok(vec![]),
                phase => Err(conflict("commit", phase)),
            },
            C::Abort { status } => match state.phase {
                P::Initialized | P::FilesInProgress | P::FilesFailed | P::FilesCompleted => {
                    Ok(vec![E::Failed { status }])
                }
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
                P::Initialized | P::FilesInProgress | P::FilesFailed | P::FilesCompleted => {
                    Ok(vec![E::Failed {
                        status: WorkflowStatus::expired(),
                    }])
                }
                P::Failed | P::Terminated => Ok(vec![]),
                phase => Err(conflict("abort-expired", phase)),
            },
        }
    }

    fn advance(mut state: UnfreezeRepoWorkflow, event: &UnfreezeRepoEvent) -> UnfreezeRepoWorkflow {
        use UnfreezeRepoEvent as E;
        match event {
            E::Started { params } => {
                state.phase = Phase::Initialized;
                state.params = Some(params.clone());
            }
            E::FilesStarted => state.phase = Phase::FilesInProgress,
            E::FilesCompleted => state.phase = Phase::FilesCompleted,
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

/// Typed wrapper exposing the unfreeze-repo vocabulary over the engine.
#[derive(Clone)]
pub struct UnfreezeRepoWorkflows {
    engine: Engine<UnfreezeRepoBehavior>,
}

impl UnfreezeRepoWorkflows {
    pub fn new(journal: Journal) -> UnfreezeRepoWorkflows {
        UnfreezeRepoWorkflows {
            engine: Engine::new(journal),
        }
    }

    pub fn find(&self, id: Uuid) -> Result<Loaded<UnfreezeRepoWorkflow>, EngineError> {
        self.engine.find_id(id)
    }

    pub fn init(&self, id: Uuid, vid: Vid, params: UnfreezeRepoParams) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnfreezeRepoCommand::Init { params })
    }

    pub fn begin_files(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnfreezeRepoCommand::BeginFiles)
    }

    pub fn commit_files(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnfreezeRepoCommand::CommitFiles)
    }

    pub fn abort_files(
        &self,
        id: Uuid,
        vid: Vid,
        status: WorkflowStatus,
    ) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnfreezeRepoCommand::AbortFiles { status })
    }

    pub fn commit(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, UnfreezeRepoCommand::Commit)
    }

    pub fn abort(&self, id: Uuid, vid: Vid, status: WorkflowStatus) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnfreezeRepoCommand::Abort { status })
    }

    pub fn end(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, UnfreezeRepoCommand::End)
    }

    pub fn delete(&self, id: Uuid, vid: Vid) -> Result<(), EngineError> {
        self.engine
            .delete_id_vid(id, vid, UnfreezeRepoCommand::Delete)
    }

    pub fn abort_expired(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, UnfreezeRepoCommand::AbortExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{workflow_id, EventId};
    use crate::workflows::StatusCode;

    fn params() -> UnfreezeRepoParams {
        UnfreezeRepoParams {
            registry: Uuid::new_v4(),
            repo: Uuid::new_v4(),
            author: "bob".into(),
        }
    }

    #[test]
    fn happy_path_thaws_and_terminates() {
        let wf = UnfreezeRepoWorkflows::new(Journal::new());
        let id = workflow_id();

        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf.commit_files(id, v).unwrap();
        let v = wf.commit(id, v).unwrap();
        wf.end(id, v).unwrap();

        let loaded = wf.find(id).unwrap();
        assert_eq!(loaded.state.phase, Phase::Terminated);
        assert_eq!(loaded.state.status.as_ref().unwrap().code, StatusCode::Success);
    }

    #[test]
    fn files_failure_propagates_to_failed() {
        let wf = UnfreezeRepoWorkflows::new(Journal::new());
        let id = workflow_id();

        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf
            .abort_files(id, v, WorkflowStatus::failed("permission denied"))
            .unwrap();
        let v = wf
            .abort(id, v, WorkflowStatus::failed("permission denied"))
            .unwrap();
        wf.end(id, v).unwrap();

        let loaded = wf.find(id).unwrap();
        assert_eq!(loaded.state.phase, Phase::Terminated);
        assert_eq!(loaded.state.status.as_ref().unwrap().code, StatusCode::Failed);
    }

    #[test]
    fn commit_requires_files_completed() {
        let wf = UnfreezeRepoWorkflows::new(Journal::new());
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();

        let err = wf.commit(id, v).expect_err("files phase not yet run");
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }
}
