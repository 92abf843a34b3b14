//! Freeze-repo workflow: make a repository immutable.
//!
//! Two parties: the initiating process writes `Started`; the process that
//! owns the repository's files marks them read-only between `FilesStarted`
//! and `FilesCompleted` (or `FilesFailed`); the initiator then commits or
//! aborts the whole run and eventually ends it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowStatus;
use crate::engine::{Behavior, Engine, Loaded};
use crate::error::EngineError;
use crate::id::Vid;
use crate::journal::Journal;

/// Immutable parameters fixed at `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeRepoParams {
    /// Registry the repository belongs to.
    pub registry: Uuid,
    /// The repository being frozen.
    pub repo: Uuid,
    /// Who requested the freeze.
    pub author: String,
}

/// Phase codes of a freeze-repo run.
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

/// Projection of one freeze-repo stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FreezeRepoWorkflow {
    pub phase: Phase,
    pub params: Option<FreezeRepoParams>,
    /// Final status once `Completed`/`Failed` is reached.
    pub status: Option<WorkflowStatus>,
}

/// Checkpoint events of a freeze-repo run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FreezeRepoEvent {
    Started { params: FreezeRepoParams },
    FilesStarted,
    FilesCompleted,
    FilesFailed { status: WorkflowStatus },
    Completed,
    Failed { status: WorkflowStatus },
    Terminated,
}

/// Commands of a freeze-repo run.
#[derive(Debug, Clone)]
pub enum FreezeRepoCommand {
    Init { params: FreezeRepoParams },
    BeginFiles,
    CommitFiles,
    AbortFiles { status: WorkflowStatus },
    Commit,
    Abort { status: WorkflowStatus },
    End,
    Delete,
    AbortExpired,
}

pub struct FreezeRepoBehavior;

impl Behavior for FreezeRepoBehavior {
    const AGGREGATE_TYPE: &'static str = "freeze-repo";
    type State = FreezeRepoWorkflow;
    type Event = FreezeRepoEvent;
    type Command = FreezeRepoCommand;

    fn tell(
        state: &FreezeRepoWorkflow,
        cmd: FreezeRepoCommand,
    ) -> Result<Vec<FreezeRepoEvent>, EngineError> {
        use FreezeRepoCommand as C;
        use FreezeRepoEvent as E;
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

            C::CommitFiles => match state.phase {
                P::FilesInProgress => Ok(vec![E::FilesCompleted]),
                P::FilesCompleted => Ok(vec![]),
                phase => Err(conflict("commit-files", phase)),
            },

            C::AbortFiles { status } => match state.phase {
                P::FilesInProgress => Ok(vec![E::FilesFailed { status }]),
                // Idempotent regardless of the status supplied on the retry.
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
                // Always idempotent once failed, whatever the retried
                // code/message says: a retrier racing another failure path
                // must not see a conflict.
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

    fn advance(mut state: FreezeRepoWorkflow, event: &FreezeRepoEvent) -> FreezeRepoWorkflow {
        use FreezeRepoEvent as E;
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

/// Typed wrapper exposing the freeze-repo vocabulary over the engine.
#[derive(Clone)]
pub struct FreezeRepoWorkflows {
    engine: Engine<FreezeRepoBehavior>,
}

impl FreezeRepoWorkflows {
    pub fn new(journal: Journal) -> FreezeRepoWorkflows {
        FreezeRepoWorkflows {
            engine: Engine::new(journal),
        }
    }

    pub fn find(&self, id: Uuid) -> Result<Loaded<FreezeRepoWorkflow>, EngineError> {
        self.engine.find_id(id)
    }

    pub fn init(&self, id: Uuid, vid: Vid, params: FreezeRepoParams) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, FreezeRepoCommand::Init { params })
    }

    pub fn begin_files(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, FreezeRepoCommand::BeginFiles)
    }

    pub fn commit_files(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, FreezeRepoCommand::CommitFiles)
    }

    pub fn abort_files(&self, id: Uuid, vid: Vid, status: WorkflowStatus) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, FreezeRepoCommand::AbortFiles { status })
    }

    pub fn commit(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, FreezeRepoCommand::Commit)
    }

    pub fn abort(&self, id: Uuid, vid: Vid, status: WorkflowStatus) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, FreezeRepoCommand::Abort { status })
    }

    pub fn end(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, FreezeRepoCommand::End)
    }

    pub fn delete(&self, id: Uuid, vid: Vid) -> Result<(), EngineError> {
        self.engine.delete_id_vid(id, vid, FreezeRepoCommand::Delete)
    }

    pub fn abort_expired(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, FreezeRepoCommand::AbortExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{workflow_id, EventId};
    use crate::workflows::StatusCode;

    fn params() -> FreezeRepoParams {
        FreezeRepoParams {
            registry: Uuid::new_v4(),
            repo: Uuid::new_v4(),
            author: "alice".into(),
        }
    }

    fn workflows() -> FreezeRepoWorkflows {
        FreezeRepoWorkflows::new(Journal::new())
    }

    #[test]
    fn happy_path_reaches_terminated() {
        let wf = workflows();
        let id = workflow_id();
        let p = params();

        let v = wf.init(id, EventId::EPOCH, p.clone()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf.commit_files(id, v).unwrap();
        let v = wf.commit(id, v).unwrap();
        let v = wf.end(id, v).unwrap();

        let loaded = wf.find(id).unwrap();
        assert_eq!(loaded.vid, v);
        assert_eq!(loaded.state.phase, Phase::Terminated);
        assert_eq!(loaded.state.params.as_ref(), Some(&p));
        assert_eq!(loaded.state.status.as_ref().unwrap().code, StatusCode::Success);
    }

    #[test]
    fn init_retry_with_same_params_is_a_noop() {
        let wf = workflows();
        let id = workflow_id();
        let p = params();

        let v1 = wf.init(id, EventId::EPOCH, p.clone()).unwrap();
        let v2 = wf.init(id, EventId::NO_VC, p).unwrap();
        assert_eq!(v2, v1, "retried init must return the unchanged vid");
    }

    #[test]
    fn init_retry_with_different_params_hard_conflicts() {
        let wf = workflows();
        let id = workflow_id();

        wf.init(id, EventId::EPOCH, params()).unwrap();
        let err = wf
            .init(id, EventId::NO_VC, params())
            .expect_err("reusing a workflow identity for a different run must conflict");
        assert!(matches!(err, EngineError::NotIdempotent { .. }));
    }

    #[test]
    fn begin_is_idempotent_from_its_own_target_state() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v2 = wf.begin_files(id, v).unwrap();
        assert_eq!(v2, v);
    }

    #[test]
    fn begin_from_wrong_state_is_a_state_conflict() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf.commit_files(id, v).unwrap();

        let err = wf.begin_files(id, v).expect_err("files already committed");
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }

    #[test]
    fn abort_is_always_idempotent_once_failed() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf
            .abort(id, v, WorkflowStatus::failed("disk full"))
            .unwrap();

        // A different reason on the retry still reads as already-done.
        let v2 = wf
            .abort(id, v, WorkflowStatus::failed("some other reason"))
            .expect("abort in Failed must never conflict");
        assert_eq!(v2, v);
        let loaded = wf.find(id).unwrap();
        assert_eq!(loaded.state.status.as_ref().unwrap().message, "disk full");
    }

    #[test]
    fn terminal_states_only_admit_end_delete_abort() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf.commit_files(id, v).unwrap();
        let v = wf.commit(id, v).unwrap();

        assert!(matches!(
            wf.begin_files(id, v),
            Err(EngineError::StateConflict { .. })
        ));
        assert!(matches!(
            wf.abort(id, v, WorkflowStatus::failed("late")),
            Err(EngineError::StateConflict { .. })
        ));
        // End and delete remain available.
        let v = wf.end(id, v).unwrap();
        wf.delete(id, v).expect("delete after end is a no-op success");
    }

    #[test]
    fn end_retry_after_terminated_is_safe() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf
            .abort_files(id, v, WorkflowStatus::failed("files failed"))
            .unwrap();
        let v = wf.abort(id, v, WorkflowStatus::failed("files failed")).unwrap();
        let v = wf.end(id, v).unwrap();

        let v2 = wf.end(id, EventId::NO_VC).expect("end retry is always safe");
        assert_eq!(v2, v);
    }

    #[test]
    fn delete_rejected_while_in_flight() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        wf.begin_files(id, v).unwrap();

        let err = wf
            .delete(id, EventId::NO_VC)
            .expect_err("in-flight workflow must not be deletable");
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }

    #[test]
    fn delete_of_never_started_workflow_is_a_noop() {
        let wf = workflows();
        wf.delete(workflow_id(), EventId::EPOCH)
            .expect("uninitialized delete is error-free");
    }

    #[test]
    fn abort_expired_from_any_in_flight_state() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        wf.begin_files(id, v).unwrap();

        wf.abort_expired(id, EventId::RETRY_NO_VC).unwrap();
        let loaded = wf.find(id).unwrap();
        assert_eq!(loaded.state.phase, Phase::Failed);
        assert_eq!(loaded.state.status.as_ref().unwrap().code, StatusCode::Expired);
    }

    #[test]
    fn abort_expired_never_touches_a_completed_run() {
        let wf = workflows();
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.begin_files(id, v).unwrap();
        let v = wf.commit_files(id, v).unwrap();
        wf.commit(id, v).unwrap();

        let err = wf
            .abort_expired(id, EventId::RETRY_NO_VC)
            .expect_err("a legitimately completed run must not be force-expired");
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }
}
