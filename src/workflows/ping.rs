//! Ping-registry workflow: verify that every file server can reach a
//! registry's root.
//!
//! Fan-in rather than a phase chain: after `init`, each file server
//! independently records its ping, the initiator gathers the results once
//! it has seen enough, then completes. The accumulated server list is
//! bounded so a misconfigured fleet cannot grow the event unboundedly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowStatus;
use crate::engine::{Behavior, Engine, Loaded};
use crate::error::EngineError;
use crate::id::Vid;
use crate::journal::Journal;

/// Upper bound on distinct servers recorded per run.
pub const MAX_SERVER_PINGS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRegistryParams {
    pub registry: Uuid,
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Uninitialized,
    /// Accepting server pings.
    Initialized,
    Gathered,
    Completed,
    Failed,
    Terminated,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Initialized => "initialized",
            Phase::Gathered => "gathered",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingRegistryWorkflow {
    pub phase: Phase,
    pub params: Option<PingRegistryParams>,
    /// Servers that have pinged, in arrival order, no duplicates.
    pub servers: Vec<String>,
    pub status: Option<WorkflowStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PingRegistryEvent {
    Started { params: PingRegistryParams },
    ServerPinged { server: String },
    Gathered,
    Completed,
    Failed { status: WorkflowStatus },
    Terminated,
}

#[derive(Debug, Clone)]
pub enum PingRegistryCommand {
    Init { params: PingRegistryParams },
    RecordPing { server: String },
    CommitGather,
    Commit,
    Abort { status: WorkflowStatus },
    End,
    Delete,
    AbortExpired,
}

pub struct PingRegistryBehavior;

impl Behavior for PingRegistryBehavior {
    const AGGREGATE_TYPE: &'static str = "ping-registry";
    type State = PingRegistryWorkflow;
    type Event = PingRegistryEvent;
    type Command = PingRegistryCommand;

    fn tell(
        state: &PingRegistryWorkflow,
        cmd: PingRegistryCommand,
    ) -> Result<Vec<PingRegistryEvent>, EngineError> {
        use Phase as P;
        use PingRegistryCommand as C;
        use PingRegistryEvent as E;

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
                                "stored params for registry {} do not match retry",
                                stored.registry
                            ),
                        })
                    }
                }
                phase => Err(conflict("init", phase)),
            },
            C::RecordPing { server } => match state.phase {
                P::Initialized => {
                    if state.servers.iter().any(|s| *s == server) {
                        return Ok(vec![]);
                    }
                    if state.servers.len() >= MAX_SERVER_PINGS {
                        return Err(EngineError::ResourceExhausted {
                            what: "server pings",
                            limit: MAX_SERVER_PINGS,
                        });
                    }
                    Ok(vec![E::ServerPinged { server }])
                }
                // A ping that raced the gather reads as already-done if it
                // was in fact recorded.
                P::Gathered if state.servers.iter().any(|s| *s == server) => Ok(vec![]),
                P::Uninitialized => Err(EngineError::Uninitialized(Uuid::nil())),
                phase => Err(conflict("record-ping", phase)),
            },
            C::CommitGather => match state.phase {
                P::Initialized => Ok(vec![E::Gathered]),
                P::Gathered => Ok(vec![]),
                phase => Err(conflict("commit-gather", phase)),
            },
            C::Commit => match state.phase {
                P::Gathered => Ok(vec![E::Completed]),
                P::Completed => Ok(vec![]),
                phase => Err(conflict("commit", phase)),
            },
            C::Abort { status } => match state.phase {
                P::Initialized | P::Gathered => Ok(vec![E::Failed { status }]),
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
                P::Initialized | P::Gathered => Ok(vec![E::Failed {
                    status: WorkflowStatus::expired(),
                }]),
                P::Failed | P::Terminated => Ok(vec![]),
                phase => Err(conflict("abort-expired", phase)),
            },
        }
    }

    fn advance(
        mut state: PingRegistryWorkflow,
        event: &PingRegistryEvent,
    ) -> PingRegistryWorkflow {
        use PingRegistryEvent as E;
        match event {
            E::Started { params } => {
                state.phase = Phase::Initialized;
                state.params = Some(params.clone());
            }
            E::ServerPinged { server } => state.servers.push(server.clone()),
            E::Gathered => state.phase = Phase::Gathered,
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

/// Typed wrapper exposing the ping-registry vocabulary over the engine.
#[derive(Clone)]
pub struct PingRegistryWorkflows {
    engine: Engine<PingRegistryBehavior>,
}

impl PingRegistryWorkflows {
    pub fn new(journal: Journal) -> PingRegistryWorkflows {
        PingRegistryWorkflows {
            engine: Engine::new(journal),
        }
    }

    pub fn find(&self, id: Uuid) -> Result<Loaded<PingRegistryWorkflow>, EngineError> {
        self.engine.find_id(id)
    }

    pub fn init(&self, id: Uuid, vid: Vid, params: PingRegistryParams) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, PingRegistryCommand::Init { params })
    }

    pub fn record_ping(
        &self,
        id: Uuid,
        vid: Vid,
        server: impl Into<String>,
    ) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(
            id,
            vid,
            PingRegistryCommand::RecordPing {
                server: server.into(),
            },
        )
    }

    pub fn commit_gather(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, PingRegistryCommand::CommitGather)
    }

    pub fn commit(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, PingRegistryCommand::Commit)
    }

    pub fn abort(&self, id: Uuid, vid: Vid, status: WorkflowStatus) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, PingRegistryCommand::Abort { status })
    }

    pub fn end(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, PingRegistryCommand::End)
    }

    pub fn delete(&self, id: Uuid, vid: Vid) -> Result<(), EngineError> {
        self.engine
            .delete_id_vid(id, vid, PingRegistryCommand::Delete)
    }

    pub fn abort_expired(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, PingRegistryCommand::AbortExpired)
    }
}
