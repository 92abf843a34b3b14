//! Split-root workflow: measure a storage root's disk usage and decide
//! which oversized subtrees to split into their own repositories.
//!
//! Three accumulation stages, each owned by a different party: the storage
//! process records per-path disk usage, an analysis process turns the
//! measurements into split suggestions, and an operator records a decision
//! per suggestion before the run completes. All three lists are bounded so
//! a pathological directory tree cannot grow a single workflow without
//! limit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DuEntry, WorkflowStatus};
use crate::engine::{Behavior, Engine, Loaded};
use crate::error::EngineError;
use crate::id::Vid;
use crate::journal::Journal;

/// Upper bound on recorded disk-usage paths per run.
pub const MAX_DU_ENTRIES: usize = 300;
/// Upper bound on split suggestions per run.
pub const MAX_SUGGESTIONS: usize = 100;

/// Thresholds steering which subtrees get suggested for a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRootConfig {
    /// Subtrees below this usage are never suggested.
    pub min_disk_usage: u64,
    /// Subtrees above this usage are always suggested.
    pub max_disk_usage: u64,
    /// Do not descend below this depth when suggesting.
    pub min_depth: u32,
    /// Do not descend beyond this depth when measuring.
    pub max_depth: u32,
}

impl SplitRootConfig {
    /// Whether a retried `init` carrying `other` disagrees with this
    /// stored config enough to be a hard conflict.
    //
    // TODO: the second branch compares our min_disk_usage against the
    // retry's max_disk_usage, so an identical retry conflicts whenever
    // min != max. Looks like a duplicated line where only the right-hand
    // side was updated; confirm the intended comparison with the fso
    // operators before changing which retried inits are accepted.
    pub fn conflicts_with(&self, other: &SplitRootConfig) -> bool {
        self.min_disk_usage != other.min_disk_usage
            || self.min_disk_usage != other.max_disk_usage
            || self.min_depth != other.min_depth
            || self.max_depth != other.max_depth
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRootParams {
    pub registry: Uuid,
    /// The storage root being analyzed, relative to the registry.
    pub root: String,
    pub author: String,
    pub config: SplitRootConfig,
}

/// One subtree proposed for a split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub path: String,
    pub bytes: u64,
}

/// The operator's verdict on one suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub path: String,
    pub split: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Uninitialized,
    /// Accepting disk-usage measurements.
    Initialized,
    DuCompleted,
    SuggestionsCompleted,
    Completed,
    Failed,
    Terminated,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Initialized => "initialized",
            Phase::DuCompleted => "du-completed",
            Phase::SuggestionsCompleted => "suggestions-completed",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitRootWorkflow {
    pub phase: Phase,
    pub params: Option<SplitRootParams>,
    pub du: Vec<DuEntry>,
    pub suggestions: Vec<Suggestion>,
    pub decisions: Vec<Decision>,
    pub status: Option<WorkflowStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SplitRootEvent {
    Started { params: SplitRootParams },
    DuRecorded { entry: DuEntry },
    DuCompleted,
    SuggestionRecorded { suggestion: Suggestion },
    SuggestionsCompleted,
    DecisionRecorded { decision: Decision },
    Completed,
    Failed { status: WorkflowStatus },
    Terminated,
}

#[derive(Debug, Clone)]
pub enum SplitRootCommand {
    Init { params: SplitRootParams },
    RecordDu { entry: DuEntry },
    CommitDu,
    RecordSuggestion { suggestion: Suggestion },
    CommitSuggestions,
    RecordDecision { decision: Decision },
    Commit,
    Abort { status: WorkflowStatus },
    End,
    Delete,
    AbortExpired,
}

pub struct SplitRootBehavior;

impl Behavior for SplitRootBehavior {
    const AGGREGATE_TYPE: &'static str = "split-root";
    type State = SplitRootWorkflow;
    type Event = SplitRootEvent;
    type Command = SplitRootCommand;

    fn tell(
        state: &SplitRootWorkflow,
        cmd: SplitRootCommand,
    ) -> Result<Vec<SplitRootEvent>, EngineError> {
        use Phase as P;
        use SplitRootCommand as C;
        use SplitRootEvent as E;

        match cmd {
            C::Init { params } => match state.phase {
                P::Uninitialized => Ok(vec![E::Started { params }]),
                P::Initialized => {
                    let stored = state
                        .params
                        .as_ref()
                        .expect("initialized workflow always stores params");
                    if stored.registry != params.registry
                        || stored.root != params.root
                        || stored.author != params.author
                    {
                        return Err(EngineError::NotIdempotent {
                            command: "init",
                            detail: format!(
                                "stored identity for root {:?} does not match retry",
                                stored.root
                            ),
                        });
                    }
                    if stored.config.conflicts_with(&params.config) {
                        return Err(EngineError::NotIdempotent {
                            command: "init",
                            detail: "stored split config conflicts with retry".into(),
                        });
                    }
                    Ok(vec![])
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
            C::CommitDu => match state.phase {
                P::Initialized => Ok(vec![E::DuCompleted]),
                P::DuCompleted => Ok(vec![]),
                phase => Err(conflict("commit-du", phase)),
            },
            C::RecordSuggestion { suggestion } => match state.phase {
                P::DuCompleted => {
                    if let Some(stored) = state
                        .suggestions
                        .iter()
                        .find(|s| s.path == suggestion.path)
                    {
                        if *stored == suggestion {
                            return Ok(vec![]);
                        }
                        return Err(EngineError::NotIdempotent {
                            command: "record-suggestion",
                            detail: format!("path {:?} already suggested", stored.path),
                        });
                    }
                    if state.suggestions.len() >= MAX_SUGGESTIONS {
                        return Err(EngineError::ResourceExhausted {
                            what: "suggestions",
                            limit: MAX_SUGGESTIONS,
                        });
                    }
                    Ok(vec![E::SuggestionRecorded { suggestion }])
                }
                phase => Err(conflict("record-suggestion", phase)),
            },
            C::CommitSuggestions => match state.phase {
                P::DuCompleted => Ok(vec![E::SuggestionsCompleted]),
                P::SuggestionsCompleted => Ok(vec![]),
                phase => Err(conflict("commit-suggestions", phase)),
            },
            C::RecordDecision { decision } => match state.phase {
                P::SuggestionsCompleted => {
                    if !state.suggestions.iter().any(|s| s.path == decision.path) {
                        return Err(EngineError::StateConflict {
                            command: "record-decision",
                            state: "path was never suggested",
                        });
                    }
                    if let Some(stored) =
                        state.decisions.iter().find(|d| d.path == decision.path)
                    {
                        if *stored == decision {
                            return Ok(vec![]);
                        }
                        return Err(EngineError::NotIdempotent {
                            command: "record-decision",
                            detail: format!("path {:?} already decided", stored.path),
                        });
                    }
                    Ok(vec![E::DecisionRecorded { decision }])
                }
                phase => Err(conflict("record-decision", phase)),
            },
            C::Commit => match state.phase {
                P::SuggestionsCompleted => Ok(vec![E::Completed]),
                P::Completed => Ok(vec![]),
                phase => Err(conflict("commit", phase)),
            },
            C::Abort { status } => match state.phase {
                P::Initialized | P::DuCompleted | P::SuggestionsCompleted => {
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
                P::Initialized | P::DuCompleted | P::SuggestionsCompleted => Ok(vec![E::Failed {
                    status: WorkflowStatus::expired(),
                }]),
                P::Failed | P::Terminated => Ok(vec![]),
                phase => Err(conflict("abort-expired", phase)),
            },
        }
    }

    fn advance(mut state: SplitRootWorkflow, event: &SplitRootEvent) -> SplitRootWorkflow {
        use SplitRootEvent as E;
        match event {
            E::Started { params } => {
                state.phase = Phase::Initialized;
                state.params = Some(params.clone());
            }
            E::DuRecorded { entry } => state.du.push(entry.clone()),
            E::DuCompleted => state.phase = Phase::DuCompleted,
            E::SuggestionRecorded { suggestion } => state.suggestions.push(suggestion.clone()),
            E::SuggestionsCompleted => state.phase = Phase::SuggestionsCompleted,
            E::DecisionRecorded { decision } => state.decisions.push(decision.clone()),
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

/// Typed wrapper exposing the split-root vocabulary over the engine.
#[derive(Clone)]
pub struct SplitRootWorkflows {
    engine: Engine<SplitRootBehavior>,
}

impl SplitRootWorkflows {
    pub fn new(journal: Journal) -> SplitRootWorkflows {
        SplitRootWorkflows {
            engine: Engine::new(journal),
        }
    }

    pub fn find(&self, id: Uuid) -> Result<Loaded<SplitRootWorkflow>, EngineError> {
        self.engine.find_id(id)
    }

    pub fn init(&self, id: Uuid, vid: Vid, params: SplitRootParams) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, SplitRootCommand::Init { params })
    }

    pub fn record_du(&self, id: Uuid, vid: Vid, entry: DuEntry) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, SplitRootCommand::RecordDu { entry })
    }

    pub fn commit_du(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, SplitRootCommand::CommitDu)
    }

    pub fn record_suggestion(
        &self,
        id: Uuid,
        vid: Vid,
        suggestion: Suggestion,
    ) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, SplitRootCommand::RecordSuggestion { suggestion })
    }

    pub fn commit_suggestions(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, SplitRootCommand::CommitSuggestions)
    }

    pub fn record_decision(
        &self,
        id: Uuid,
        vid: Vid,
        decision: Decision,
    ) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, SplitRootCommand::RecordDecision { decision })
    }

    pub fn commit(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, SplitRootCommand::Commit)
    }

    pub fn abort(&self, id: Uuid, vid: Vid, status: WorkflowStatus) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, SplitRootCommand::Abort { status })
    }

    pub fn end(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine.tell_id_vid(id, vid, SplitRootCommand::End)
    }

    pub fn delete(&self, id: Uuid, vid: Vid) -> Result<(), EngineError> {
        self.engine.delete_id_vid(id, vid, SplitRootCommand::Delete)
    }

    pub fn abort_expired(&self, id: Uuid, vid: Vid) -> Result<Vid, EngineError> {
        self.engine
            .tell_id_vid(id, vid, SplitRootCommand::AbortExpired)
    }
}
