//! Event-sourced coordination for filesystem-backed repositories.
//!
//! Several independently-deployed daemons coordinate long-running
//! operations (archiving, freezing, splitting, measuring repositories)
//! without ever calling each other: all shared state lives in per-aggregate
//! event streams in a [`Journal`], and every cross-process handoff is
//! "watch the stream, see a checkpoint event, react with a command".
//!
//! The layers, bottom up:
//!
//! - [`journal`]: append-only per-stream log with optimistic concurrency,
//!   coalesced change notifications, and head trimming ([`trim`]).
//! - [`engine`]: the generic replay/validate/append loop, parameterized
//!   per aggregate type by a [`Behavior`].
//! - [`watch`]: the cancellable loop every watching daemon runs.
//! - [`workflows`]: the seven saga state machines built on the engine.
//! - [`index`] and [`gc`]: per-registry bookkeeping of active/completed
//!   workflows, expiry of stale runs, and log compaction.

pub mod engine;
pub mod error;
pub mod gc;
pub mod id;
pub mod index;
pub mod journal;
pub mod trim;
pub mod watch;
pub mod workflows;

pub use engine::{Behavior, Engine, Loaded};
pub use error::{EngineError, JournalError};
pub use gc::{Gc, GcConfig, Retention};
pub use id::{aggregate_id, workflow_id, EventId, Vid};
pub use index::{index_id, IndexEntry, SnapshotPolicy, WorkflowIndex, WorkflowIndexes};
pub use journal::{Event, Journal, ProposedEvent};
pub use trim::{TrimPolicy, SNAPSHOT_EPOCH_KIND};
pub use watch::{watch_stream, WatchConfig};
pub use workflows::{DuEntry, StatusCode, WorkflowKind, WorkflowSet, WorkflowStatus};
