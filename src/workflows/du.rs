//! Du-root workflow: a one-shot disk-usage measurement of a storage root.
//!
//! The lightweight sibling of [`crate::workflows::split`]: the storage
//! process records per-path usage and the initiator commits once the scan
//! is done. Runs are expected to be short; the garbage collector expires
//! any run still in flight after a day.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DuEntry, WorkflowStatus};
use crate::engine::{Behavior, Engine, Loaded};
use crate::error::EngineError;
use crate::id::Vid;
use crate::journal::Journal;

/// Upper bound on recorded disk-usage paths per run.
pub const MAX_DU_ENTRIES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuRootParams {
    pub registry: Uuid,
    /// The storage root being measured, relative to the registry.
    pub root: String,
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Uninitialized,
    /// Accepting disk-usage measurements.
    Initialized,
    Completed,
    Failed,
    Terminated,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Initialized => "initialized",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DuRootWorkflow {
    pub phase: Phase,
    pub params: Option<DuRootParams>,
    pub du: Vec<DuEntry>,
    pub status: Option<WorkflowStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DuRootEvent {
    Started { params: DuRootParams },
    DuRecorded { entry: DuEntry },
    Completed,
    Failed { status: WorkflowStatus },
    Terminated,
}

#[derive(Debug, Clone)]
pub enum DuRootCommand {
    Init { params: DuRootParams },
    RecordDu { entry: DuEntry },
    Commit,
    Abort { status: WorkflowStatus },
    End,
    Delete,
    AbortExpired,
}

pub struct DuRootBehavior;

impl Behavior for DuRootBehavior {
    const AGGREGATE_TYPE: &'static str = "du-root";
    type State = DuRootWorkflow;
    type Event = DuRootEvent;
    type Command = DuRootCommand;

    fn tell(state: &DuRootWorkflow, cmd: DuRootCommand) -> Result<Vec<DuRootEvent>, EngineError> {
        use DuRootCommand as C;
        use DuRootEvent as E;
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
                                "stored identity for root {:?} does not match retry",
                                stored.root
                            ),
                        })
                    }
                }
                phase => Err(conflict("init", phase)),
            },
            C::RecordDu { entry } => match state.phase {
                P::Initialized => {
                    if let Some(stored) = state.du.iter().find(|e| e.path == entry.path) {
                        if *stored == entry {
                            return Ok(vec![]);
                        }
                        return Err(EngineError::NotIdempotent {
                            command: "record-du",
                            detail: format!(
                                "path {:?} already recorded with {} bytes",
                                stored.path, stored.bytes
                            ),
                        });
                    }
                    if state.du.len() >= MAX_DU_ENTRIES {
                        return Err(EngineError::ResourceExhausted {
                            what: "du paths",
                            limit: MAX_DU_ENTRIES,
                        });
                    }
                    Ok(vec![E::DuRecorded { entry }])
                }
                P::Uninitialized => Err(EngineError::Uninitialized(Uuid::nil())),
                phase => Err(conflict("record-du", phase)),
            },
            C::Commit => match state.phase {
                P::Initialized => Ok(vec![E::Completed]),
                P::Completed => Ok(vec![]),
                phase => Err(conflict("commit", phase)),
            },
            C::Abort { status } => match state.phase {
                P::Initialized => Ok(vec![E::Failed { status }]),
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
                P::Initialized => Ok(vec![E::Failed {
                    status: WorkflowStatus::expired(),
                }]),
                P::Failed | P::Terminated => Ok(vec![]),
                phase => Err(conflict("abort-expired", phase)),
            },
        }
    }

    fn advance(mut state: DuRootWorkflow, event: &DuRootEvent) -> DuRootWorkflow {
        use DuRootEvent as E;
        match event {
            E::Started { params } => {
                state.phase = Phase::Initialized;
                state.params = Some(params.clone());
            }
            E::DuRecorded { entry } => state.du.push(entry.clone()),
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

/// Typed wrapper exposing the du-root vocabulary over the engine.
#[derive(Clone)]
pub struct DuRootWorkflows {
    engine: Engine<DuRootBehavior>,
}

impl DuRootWorkflows {
    pub fn new(journal: Journal) -> DuRootWorkflows {
        DuRootWorkflows {
            engine: Engine::new(journal),
        }
    }

    pub fn find(&self, id: Uuid) -> Result<Loaded<DuRootWorkflow>, EngineError> {
        self.engine.find_id(id)
    }

    pub fn init(&self, id: Uuid, vid: Vid, params: DuRootParams) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, DuRootCommand::Init { params })
    }

    pub fn record_du(&self, id: Uuid, vid: Vid, entry: DuEntry) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, DuRootCommand::RecordDu { entry })
    }

    pub fn commit(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, DuRootCommand::Commit)
    }

    pub fn abort(&self, id: Uuid, vid: Vid, status: WorkflowStatus) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, DuRootCommand::Abort { status })
    }

    pub fn end(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, DuRootCommand::End)
    }

    pub fn delete(&self, id: Uuid, vid: Vid) -> Result<(), EngineError> {
        self.engine.delete_id_vid(id, vid, DuRootCommand::Delete)
    }

    pub fn abort_expired(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, DuRootCommand::AbortExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{workflow_id, EventId};
    use crate::workflows::StatusCode;

    fn params() -> DuRootParams {
        DuRootParams {
            registry: Uuid::new_v4(),
            root: "tape/physics".into(),
            author: "ops".into(),
        }
    }

    fn du(path: &str, bytes: u64) -> DuEntry {
        DuEntry {
            path: path.into(),
            bytes,
        }
    }

    #[test]
    fn scan_records_and_completes() {
        let wf = DuRootWorkflows::new(Journal::new());
        let id = workflow_id();

        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.record_du(id, v, du("a", 100)).unwrap();
        let v = wf.record_du(id, v, du("b", 200)).unwrap();
        let v = wf.commit(id, v).unwrap();
        wf.end(id, v).unwrap();

        let loaded = wf.find(id).unwrap();
        assert_eq!(loaded.state.phase, Phase::Terminated);
        assert_eq!(loaded.state.du.len(), 2);
        assert_eq!(loaded.state.status.as_ref().unwrap().code, StatusCode::Success);
    }

    #[test]
    fn record_after_commit_is_rejected() {
        let wf = DuRootWorkflows::new(Journal::new());
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        let v = wf.commit(id, v).unwrap();

        let err = wf
            .record_du(id, v, du("late", 1))
            .expect_err("scan already committed");
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }

    #[test]
    fn gc_expiry_aborts_an_in_flight_scan() {
        let wf = DuRootWorkflows::new(Journal::new());
        let id = workflow_id();
        let v = wf.init(id, EventId::EPOCH, params()).unwrap();
        wf.record_du(id, v, du("a", 1)).unwrap();

        let v = wf.abort_expired(id, EventId::RETRY_NO_VC).unwrap();
        wf.end(id, v).unwrap();

        let loaded = wf.find(id).unwrap();
        assert_eq!(loaded.state.phase, Phase::Terminated);
        assert_eq!(loaded.state.status.as_ref().unwrap().code, StatusCode::Expired);
    }

    #[test]
    fn entry_cap_rejects_without_writing() {
        let wf = DuRootWorkflows::new(Journal::new());
        let id = workflow_id();
        let mut v = wf.init(id, EventId::EPOCH, params()).unwrap();
        for i in 0..MAX_DU_ENTRIES {
            v = wf.record_du(id, v, du(&format!("p/{i}"), 1)).unwrap();
        }

        let err = wf
            .record_du(id, v, du("p/overflow", 1))
            .expect_err("cap exceeded");
        assert!(matches!(err, EngineError::ResourceExhausted { .. }));
        assert_eq!(wf.find(id).unwrap().vid, v);
    }
}
