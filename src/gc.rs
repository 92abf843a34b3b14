//! Workflow garbage collector.
//!
//! Periodically walks each registry's workflow index: force-expires active
//! workflows that have outlived their kind's max-active window, deletes
//! completed workflows past their delete-after window, then asks the index
//! to snapshot itself and trims the index stream. Ages come from the v7
//! timestamps embedded in the indexed vids, so no extra bookkeeping stream
//! is needed.
//!
//! A single item's failure is logged and skipped; the scan carries on.
//! Only cancellation stops the loop.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::EngineError;
use crate::id::{EventId, Vid};
use crate::index::{index_id, IndexEntry, SnapshotPolicy, WorkflowIndexes};
use crate::journal::Journal;
use crate::trim::TrimPolicy;
use crate::workflows::{WorkflowKind, WorkflowSet};

/// Per-kind retention windows.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    /// An active workflow older than this is force-expired.
    pub max_active: Duration,
    /// A completed workflow older than this is deleted.
    pub delete_after: Duration,
}

const DAY: Duration = Duration::from_secs(24 * 3_600);

impl Default for Retention {
    fn default() -> Self {
        Retention {
            max_active: DAY,
            delete_after: 14 * DAY,
        }
    }
}

/// Garbage collector schedule and policies.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Delay before the first pass after startup.
    pub start_delay: Duration,
    /// Time between passes.
    pub interval: Duration,
    /// Random extra delay added to each wait, spreading passes across
    /// registries so they do not all hit the journal at once.
    pub jitter: Duration,
    /// When an index snapshot is worth taking.
    pub snapshot: SnapshotPolicy,
    /// When the index stream's head may be discarded.
    pub trim: TrimPolicy,
    /// Per-kind overrides; kinds not listed use [`Retention::default`].
    pub retention: HashMap<WorkflowKind, Retention>,
}

impl Default for GcConfig {
    fn default() -> Self {
        let mut retention = HashMap::new();
        // The long-haul file moves get a week to finish; measurements and
        // pings are expected to wrap up within a day.
        for kind in [
            WorkflowKind::ArchiveRepo,
            WorkflowKind::UnarchiveRepo,
            WorkflowKind::SplitRoot,
        ] {
            retention.insert(
                kind,
                Retention {
                    max_active: 7 * DAY,
                    delete_after: 14 * DAY,
                },
            );
        }
        retention.insert(
            WorkflowKind::PingRegistry,
            Retention {
                max_active: DAY,
                delete_after: 5 * DAY,
            },
        );
        retention.insert(
            WorkflowKind::DuRoot,
            Retention {
                max_active: DAY,
                delete_after: 7 * DAY,
            },
        );

        GcConfig {
            start_delay: Duration::from_secs(60),
            interval: Duration::from_secs(3_600),
            jitter: Duration::from_secs(300),
            snapshot: SnapshotPolicy::default(),
            trim: TrimPolicy::default(),
            retention,
        }
    }
}

impl GcConfig {
    fn retention(&self, kind: WorkflowKind) -> Retention {
        self.retention.get(&kind).copied().unwrap_or_default()
    }
}

/// The collector, bound to one journal.
#[derive(Clone)]
pub struct Gc {
    journal: Journal,
    workflows: WorkflowSet,
    indexes: WorkflowIndexes,
    config: GcConfig,
}

impl Gc {
    pub fn new(journal: Journal, config: GcConfig) -> Gc {
        Gc {
            workflows: WorkflowSet::new(journal.clone()),
            indexes: WorkflowIndexes::new(journal.clone()),
            journal,
            config,
        }
    }

    /// Run passes over `registries` until cancelled.
    ///
    /// Waits `start_delay` plus jitter before the first pass, then
    /// `interval` plus jitter between passes. A dropped cancellation
    /// sender reads as "stop": the collector never runs without an owner
    /// that can stop it.
    pub async fn run(&self, registries: Vec<Uuid>, mut cancel: watch::Receiver<bool>) {
        // `changed` never fires for a value set before we subscribed.
        if *cancel.borrow() {
            tracing::debug!("gc loop cancelled");
            return;
        }

        let mut wait = self.config.start_delay + self.jitter();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                res = cancel.changed() => {
                    if res.is_err() || *cancel.borrow() {
                        tracing::debug!("gc loop cancelled");
                        return;
                    }
                    continue;
                }
            }

            for &registry in &registries {
                self.pass(registry);
            }
            wait = self.config.interval + self.jitter();
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.config.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// One pass over one registry: expire, delete, snapshot, trim.
    ///
    /// Item failures are logged and skipped; the pass itself only fails
    /// if the index cannot be loaded at all.
    pub fn pass(&self, registry: Uuid) {
        let index_stream = index_id(registry);
        let loaded = match self.indexes.find(index_stream) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(registry = %registry, error = %e, "gc: index load failed");
                return;
            }
        };

        let now = now_millis();
        for kind in WorkflowKind::ALL {
            let retention = self.config.retention(kind);
            for entry in loaded.state.bucket(kind) {
                let result = if entry.is_active() {
                    self.expire_if_overdue(index_stream, kind, entry, retention, now)
                } else {
                    self.delete_if_overdue(index_stream, kind, entry, retention, now)
                };
                if let Err(e) = result {
                    if e.is_benign_for_retry() {
                        tracing::debug!(
                            kind = %kind,
                            workflow = %entry.workflow_id,
                            error = %e,
                            "gc: item raced another writer, will retry next pass"
                        );
                    } else {
                        tracing::warn!(
                            kind = %kind,
                            workflow = %entry.workflow_id,
                            error = %e,
                            "gc: item failed, continuing scan"
                        );
                    }
                }
            }
        }

        match self
            .indexes
            .snapshot(index_stream, EventId::NO_VC, self.config.snapshot.clone())
        {
            Ok(vid) => tracing::info!(registry = %registry, vid = %vid, "gc: index snapshot taken"),
            Err(EngineError::SnapshotSkipped(reason)) => {
                tracing::debug!(registry = %registry, reason, "gc: index snapshot skipped")
            }
            Err(e) => tracing::warn!(registry = %registry, error = %e, "gc: index snapshot failed"),
        }

        if let Err(e) = self.journal.trim_stream(index_stream, &self.config.trim) {
            tracing::warn!(registry = %registry, error = %e, "gc: index trim failed");
        }
    }

    fn expire_if_overdue(
        &self,
        index_stream: Uuid,
        kind: WorkflowKind,
        entry: &IndexEntry,
        retention: Retention,
        now: u64,
    ) -> Result<(), EngineError> {
        if !older_than(entry.started_vid, retention.max_active, now) {
            return Ok(());
        }
        tracing::info!(
            kind = %kind,
            workflow = %entry.workflow_id,
            "gc: expiring overdue workflow"
        );

        let terminal_vid = match self
            .workflows
            .abort_expired(kind, entry.workflow_id, EventId::RETRY_NO_VC)
        {
            Ok(vid) => vid,
            // The workflow legitimately completed while the index still
            // showed it active; it is terminal either way, close it out.
            Err(EngineError::StateConflict { .. }) => {
                self.workflows
                    .end(kind, entry.workflow_id, EventId::RETRY_NO_VC)?
            }
            Err(e) => return Err(e),
        };
        self.workflows
            .end(kind, entry.workflow_id, EventId::RETRY_NO_VC)?;
        self.indexes.commit_completed(
            index_stream,
            EventId::RETRY_NO_VC,
            kind,
            entry.workflow_id,
            terminal_vid,
        )?;
        Ok(())
    }

    fn delete_if_overdue(
        &self,
        index_stream: Uuid,
        kind: WorkflowKind,
        entry: &IndexEntry,
        retention: Retention,
        now: u64,
    ) -> Result<(), EngineError> {
        let completed_vid = entry
            .completed_vid
            .expect("delete_if_overdue only sees completed entries");
        if !older_than(completed_vid, retention.delete_after, now) {
            return Ok(());
        }
        tracing::info!(
            kind = %kind,
            workflow = %entry.workflow_id,
            "gc: deleting old completed workflow"
        );

        self.workflows
            .delete(kind, entry.workflow_id, EventId::RETRY_NO_VC)?;
        self.indexes.commit_deleted(
            index_stream,
            EventId::RETRY_NO_VC,
            kind,
            entry.workflow_id,
        )?;
        // Unindexed and deleted: reclaim the stream itself, or terminated
        // workflows accumulate in the journal for the life of the process.
        self.journal.drop_stream(entry.workflow_id)?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whether the v7 timestamp in `vid` lies more than `window` in the past.
///
/// Vids without a timestamp (sentinels) never read as overdue.
fn older_than(vid: Vid, window: Duration, now: u64) -> bool {
    vid.timestamp_millis()
        .is_some_and(|ts| now.saturating_sub(ts) > window.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::du::DuRootParams;
    use crate::workflows::ping::PingRegistryParams;
    use crate::workflows::{du, ping, StatusCode};

    /// A v7 vid whose embedded timestamp lies `age` in the past.
    fn backdated_vid(age: Duration) -> Vid {
        let secs = (SystemTime::now() - age)
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        EventId::from_uuid(Uuid::new_v7(uuid::Timestamp::from_unix(
            uuid::NoContext,
            secs,
            0,
        )))
    }

    fn eager_config() -> GcConfig {
        GcConfig {
            start_delay: Duration::ZERO,
            interval: Duration::from_millis(10),
            jitter: Duration::ZERO,
            snapshot: SnapshotPolicy { min_events: 1_000_000 },
            trim: TrimPolicy::default(),
            retention: GcConfig::default().retention,
        }
    }

    #[test]
    fn overdue_du_root_is_expired_and_ended() {
        let journal = Journal::new();
        let gc = Gc::new(journal.clone(), eager_config());
        let registry = Uuid::new_v4();

        let du_wf = du::DuRootWorkflows::new(journal.clone());
        let wf_id = crate::id::workflow_id();
        du_wf
            .init(
                wf_id,
                EventId::EPOCH,
                DuRootParams {
                    registry,
                    root: "tape/x".into(),
                    author: "ops".into(),
                },
            )
            .unwrap();

        // Index it as started two days ago; max-active for du-root is one
        // day.
        gc.indexes
            .commit_started(
                index_id(registry),
                EventId::RETRY_NO_VC,
                WorkflowKind::DuRoot,
                wf_id,
                backdated_vid(2 * DAY),
            )
            .unwrap();

        gc.pass(registry);

        let loaded = du_wf.find(wf_id).unwrap();
        assert_eq!(loaded.state.phase, du::Phase::Terminated);
        assert_eq!(loaded.state.status.as_ref().unwrap().code, StatusCode::Expired);
        // The index now shows it completed.
        let index = gc.indexes.find(index_id(registry)).unwrap();
        assert!(!index.state.bucket(WorkflowKind::DuRoot)[0].is_active());
    }

    #[test]
    fn fresh_workflows_are_left_alone() {
        let journal = Journal::new();
        let gc = Gc::new(journal.clone(), eager_config());
        let registry = Uuid::new_v4();

        let du_wf = du::DuRootWorkflows::new(journal);
        let wf_id = crate::id::workflow_id();
        let started = du_wf
            .init(
                wf_id,
                EventId::EPOCH,
                DuRootParams {
                    registry,
                    root: "tape/y".into(),
                    author: "ops".into(),
                },
            )
            .unwrap();
        gc.indexes
            .commit_started(
                index_id(registry),
                EventId::RETRY_NO_VC,
                WorkflowKind::DuRoot,
                wf_id,
                started,
            )
            .unwrap();

        gc.pass(registry);

        assert_eq!(du_wf.find(wf_id).unwrap().state.phase, du::Phase::Initialized);
    }

    #[test]
    fn old_completed_ping_is_deleted_and_second_pass_is_a_noop() {
        let journal = Journal::new();
        let gc = Gc::new(journal.clone(), eager_config());
        let registry = Uuid::new_v4();

        // A ping-registry run driven to Terminated.
        let ping_wf = ping::PingRegistryWorkflows::new(journal);
        let wf_id = crate::id::workflow_id();
        let v = ping_wf
            .init(
                wf_id,
                EventId::EPOCH,
                PingRegistryParams {
                    registry,
                    author: "ops".into(),
                },
            )
            .unwrap();
        let v = ping_wf.commit_gather(wf_id, v).unwrap();
        let v = ping_wf.commit(wf_id, v).unwrap();
        ping_wf.end(wf_id, v).unwrap();

        // Indexed as completed six days ago; delete-after for pings is
        // five days.
        let ix = index_id(registry);
        gc.indexes
            .commit_started(
                ix,
                EventId::RETRY_NO_VC,
                WorkflowKind::PingRegistry,
                wf_id,
                backdated_vid(7 * DAY),
            )
            .unwrap();
        gc.indexes
            .commit_completed(
                ix,
                EventId::RETRY_NO_VC,
                WorkflowKind::PingRegistry,
                wf_id,
                backdated_vid(6 * DAY),
            )
            .unwrap();

        gc.pass(registry);
        let index = gc.indexes.find(ix).unwrap();
        assert!(
            index.state.bucket(WorkflowKind::PingRegistry).is_empty(),
            "deleted workflow must leave the index"
        );
        assert!(
            gc.journal.find(wf_id, EventId::EPOCH).unwrap().is_empty(),
            "deleted workflow's stream must be dropped from the journal"
        );

        // Second pass finds nothing to do.
        let vid_before = gc.indexes.find(ix).unwrap().vid;
        gc.pass(registry);
        assert_eq!(gc.indexes.find(ix).unwrap().vid, vid_before);
    }

    #[test]
    fn expiry_never_touches_a_completed_run() {
        let journal = Journal::new();
        let gc = Gc::new(journal.clone(), eager_config());
        let registry = Uuid::new_v4();

        // Completed but the index still shows it active with an ancient
        // start: the GC must close it out without force-expiring it.
        let du_wf = du::DuRootWorkflows::new(journal);
        let wf_id = crate::id::workflow_id();
        let v = du_wf
            .init(
                wf_id,
                EventId::EPOCH,
                DuRootParams {
                    registry,
                    root: "tape/z".into(),
                    author: "ops".into(),
                },
            )
            .unwrap();
        du_wf.commit(wf_id, v).unwrap();

        gc.indexes
            .commit_started(
                index_id(registry),
                EventId::RETRY_NO_VC,
                WorkflowKind::DuRoot,
                wf_id,
                backdated_vid(2 * DAY),
            )
            .unwrap();

        gc.pass(registry);

        let loaded = du_wf.find(wf_id).unwrap();
        assert_eq!(loaded.state.phase, du::Phase::Terminated);
        assert_eq!(
            loaded.state.status.as_ref().unwrap().code,
            StatusCode::Success,
            "a legitimately completed run keeps its success status"
        );
    }

    #[tokio::test]
    async fn run_exits_at_once_when_already_cancelled() {
        let gc = Gc::new(Journal::new(), eager_config());
        let (_cancel_tx, cancel_rx) = watch::channel(true);

        tokio::time::timeout(Duration::from_secs(1), gc.run(vec![], cancel_rx))
            .await
            .expect("pre-cancelled gc loop must not block");
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let gc = Gc::new(Journal::new(), eager_config());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { gc.run(vec![], cancel_rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("gc loop must stop on cancel")
            .expect("no panic");
    }
}
