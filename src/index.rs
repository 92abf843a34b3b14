//! Per-registry workflow index aggregate.
//!
//! Answers "which workflows of each kind are active or completed in this
//! registry" without replaying every workflow's own stream. The garbage
//! collector drives all writes: it commits started/completed/deleted marks
//! as it observes workflow streams, and periodically asks the index to
//! snapshot itself so the index stream stays bounded (the index is the one
//! aggregate whose history grows without limit otherwise).
//!
//! A snapshot is the `SnapshotBegin` + per-bucket dump + `SnapshotEnd`
//! triple: replaying the triple yields the same projection as replaying the
//! history it stands in for, which is what lets [`crate::trim`] discard the
//! head of the stream.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{Behavior, Engine, Loaded};
use crate::error::EngineError;
use crate::id::{aggregate_id, Vid};
use crate::journal::Journal;
use crate::workflows::WorkflowKind;

/// Hard ceiling on workflows held in one index.
///
/// Bounds both the in-memory state and the size of a snapshot dump event.
pub const MAX_INDEXED_WORKFLOWS: usize = 1_000;

/// Deterministic stream id of a registry's workflow index.
pub fn index_id(registry: Uuid) -> Uuid {
    aggregate_id("workflow-index", &registry.to_string())
}

/// When an on-demand snapshot is worth taking.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    /// Fewer accumulated events than this and the snapshot is skipped.
    pub min_events: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy { min_events: 100 }
    }
}

/// One tracked workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub workflow_id: Uuid,
    /// Vid of the workflow's `Started` event; its v7 timestamp is the
    /// run's age for expiry decisions.
    pub started_vid: Vid,
    /// Vid of the workflow's `Completed`/`Failed` event; `None` means
    /// the workflow is still active.
    pub completed_vid: Option<Vid>,
}

impl IndexEntry {
    pub fn is_active(&self) -> bool {
        self.completed_vid.is_none()
    }
}

/// Projection of one registry's index stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowIndex {
    /// Entries per workflow kind, in insertion order.
    pub buckets: HashMap<WorkflowKind, Vec<IndexEntry>>,
    /// The workflow most recently committed to the index. A fast
    /// idempotence check for the GC's commit retries.
    pub last_committed: Option<Uuid>,
    /// Events folded since the last `SnapshotBegin`; drives the snapshot
    /// profitability gate.
    pub events_since_snapshot: u64,
}

impl WorkflowIndex {
    /// Entries of one kind; empty slice if the bucket does not exist.
    pub fn bucket(&self, kind: WorkflowKind) -> &[IndexEntry] {
        self.buckets.get(&kind).map_or(&[], Vec::as_slice)
    }

    fn entry(&self, kind: WorkflowKind, workflow_id: Uuid) -> Option<&IndexEntry> {
        self.bucket(kind).iter().find(|e| e.workflow_id == workflow_id)
    }

    fn total_entries(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IndexEvent {
    Started {
        kind: WorkflowKind,
        workflow_id: Uuid,
        started_vid: Vid,
    },
    Completed {
        kind: WorkflowKind,
        workflow_id: Uuid,
        completed_vid: Vid,
    },
    Deleted {
        kind: WorkflowKind,
        workflow_id: Uuid,
    },
    /// Opens a snapshot; a legal replay epoch for head trimming.
    SnapshotBegin,
    /// Full dump of one non-empty bucket.
    SnapshotBucket {
        kind: WorkflowKind,
        entries: Vec<IndexEntry>,
    },
    /// Closes a snapshot, restoring the fast-idempotence marker.
    SnapshotEnd { last_committed: Option<Uuid> },
}

#[derive(Debug, Clone)]
pub enum IndexCommand {
    CommitStarted {
        kind: WorkflowKind,
        workflow_id: Uuid,
        started_vid: Vid,
    },
    CommitCompleted {
        kind: WorkflowKind,
        workflow_id: Uuid,
        completed_vid: Vid,
    },
    CommitDeleted {
        kind: WorkflowKind,
        workflow_id: Uuid,
    },
    Snapshot {
        policy: SnapshotPolicy,
    },
}

pub struct IndexBehavior;

impl Behavior for IndexBehavior {
    const AGGREGATE_TYPE: &'static str = "workflow-index";
    type State = WorkflowIndex;
    type Event = IndexEvent;
    type Command = IndexCommand;

    fn tell(state: &WorkflowIndex, cmd: IndexCommand) -> Result<Vec<IndexEvent>, EngineError> {
        match cmd {
            IndexCommand::CommitStarted {
                kind,
                workflow_id,
                started_vid,
            } => {
                if let Some(entry) = state.entry(kind, workflow_id) {
                    if entry.started_vid == started_vid {
                        return Ok(vec![]);
                    }
                    return Err(EngineError::NotIdempotent {
                        command: "commit-started",
                        detail: format!(
                            "workflow {workflow_id} already indexed with a different start vid"
                        ),
                    });
                }
                if state.total_entries() >= MAX_INDEXED_WORKFLOWS {
                    return Err(EngineError::ResourceExhausted {
                        what: "indexed workflows",
                        limit: MAX_INDEXED_WORKFLOWS,
                    });
                }
                Ok(vec![IndexEvent::Started {
                    kind,
                    workflow_id,
                    started_vid,
                }])
            }

            IndexCommand::CommitCompleted {
                kind,
                workflow_id,
                completed_vid,
            } => match state.entry(kind, workflow_id) {
                Some(entry) if entry.completed_vid.is_some() => Ok(vec![]),
                Some(_) => Ok(vec![IndexEvent::Completed {
                    kind,
                    workflow_id,
                    completed_vid,
                }]),
                None => Err(EngineError::UnknownWorkflow(workflow_id)),
            },

            IndexCommand::CommitDeleted { kind, workflow_id } => {
                // Removing an absent entry is the retried form of a delete
                // that already went through.
                if state.entry(kind, workflow_id).is_none() {
                    return Ok(vec![]);
                }
                Ok(vec![IndexEvent::Deleted { kind, workflow_id }])
            }

            IndexCommand::Snapshot { policy } => {
                if state.events_since_snapshot < policy.min_events {
                    return Err(EngineError::SnapshotSkipped(format!(
                        "only {} events since last snapshot, need {}",
                        state.events_since_snapshot, policy.min_events
                    )));
                }
                let total = state.total_entries();
                if total > MAX_INDEXED_WORKFLOWS {
                    return Err(EngineError::ResourceExhausted {
                        what: "indexed workflows",
                        limit: MAX_INDEXED_WORKFLOWS,
                    });
                }
                // One dump record per entry plus the bracketing pair; if
                // that is no smaller than the raw events it replaces, the
                // snapshot buys nothing.
                let estimated_cost = 2 + total as u64;
                if estimated_cost >= state.events_since_snapshot {
                    return Err(EngineError::SnapshotSkipped(format!(
                        "snapshot of {total} entries would not beat {} raw events",
                        state.events_since_snapshot
                    )));
                }

                let mut events = vec![IndexEvent::SnapshotBegin];
                for kind in WorkflowKind::ALL {
                    let entries = state.bucket(kind);
                    if !entries.is_empty() {
                        events.push(IndexEvent::SnapshotBucket {
                            kind,
                            entries: entries.to_vec(),
                        });
                    }
                }
                events.push(IndexEvent::SnapshotEnd {
                    last_committed: state.last_committed,
                });
                Ok(events)
            }
        }
    }

    fn advance(mut state: WorkflowIndex, event: &IndexEvent) -> WorkflowIndex {
        match event {
            IndexEvent::Started {
                kind,
                workflow_id,
                started_vid,
            } => {
                state.buckets.entry(*kind).or_default().push(IndexEntry {
                    workflow_id: *workflow_id,
                    started_vid: *started_vid,
                    completed_vid: None,
                });
                state.last_committed = Some(*workflow_id);
                state.events_since_snapshot += 1;
            }
            IndexEvent::Completed {
                kind,
                workflow_id,
                completed_vid,
            } => {
                if let Some(entry) = state
                    .buckets
                    .entry(*kind)
                    .or_default()
                    .iter_mut()
                    .find(|e| e.workflow_id == *workflow_id)
                {
                    entry.completed_vid = Some(*completed_vid);
                }
                state.last_committed = Some(*workflow_id);
                state.events_since_snapshot += 1;
            }
            IndexEvent::Deleted { kind, workflow_id } => {
                if let Some(bucket) = state.buckets.get_mut(kind) {
                    bucket.retain(|e| e.workflow_id != *workflow_id);
                    if bucket.is_empty() {
                        state.buckets.remove(kind);
                    }
                }
                state.last_committed = Some(*workflow_id);
                state.events_since_snapshot += 1;
            }
            // A snapshot replays as: forget everything, then reload the
            // dumped buckets. Equivalent to the history it replaced.
            IndexEvent::SnapshotBegin => {
                state.buckets.clear();
                state.last_committed = None;
                state.events_since_snapshot = 0;
            }
            IndexEvent::SnapshotBucket { kind, entries } => {
                state.buckets.insert(*kind, entries.clone());
            }
            IndexEvent::SnapshotEnd { last_committed } => {
                state.last_committed = *last_committed;
            }
        }
        state
    }
}

/// Typed wrapper exposing the index vocabulary over the engine.
#[derive(Clone)]
pub struct WorkflowIndexes {
    engine: Engine<IndexBehavior>,
}

impl WorkflowIndexes {
    pub fn new(journal: Journal) -> WorkflowIndexes {
        WorkflowIndexes {
            engine: Engine::new(journal),
        }
    }

    pub fn find(&self, id: Uuid) -> Result<Loaded<WorkflowIndex>, EngineError> {
        self.engine.find_id(id)
    }

    pub fn commit_started(
        &self,
        id: Uuid,
        vid: Vid,
        kind: WorkflowKind,
        workflow_id: Uuid,
        started_vid: Vid,
    ) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(
            id,
            vid,
            IndexCommand::CommitStarted {
                kind,
                workflow_id,
                started_vid,
            },
        )
    }

    pub fn commit_completed(
        &self,
        id: Uuid,
        vid: Vid,
        kind: WorkflowKind,
        workflow_id: Uuid,
        completed_vid: Vid,
    ) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(
            id,
            vid,
            IndexCommand::CommitCompleted {
                kind,
                workflow_id,
                completed_vid,
            },
        )
    }

    pub fn commit_deleted(
        &self,
        id: Uuid,
        vid: Vid,
        kind: WorkflowKind,
        workflow_id: Uuid,
    ) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, IndexCommand::CommitDeleted { kind, workflow_id })
    }

    /// Attempt a snapshot; [`EngineError::SnapshotSkipped`] is the benign
    /// "not worth it" outcome.
    pub fn snapshot(&self, id: Uuid, vid: Vid, policy: SnapshotPolicy) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, IndexCommand::Snapshot { policy })
    }
}
