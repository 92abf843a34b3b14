//! Snapshot epochs and journal head trimming.
//!
//! A snapshot replaces the full history up to a point: replaying from the
//! `SnapshotBegin` event yields the same projection as replaying everything
//! it stands in for. Once a snapshot event has been stable for a configured
//! minimum age (long enough that slow or crashed readers have caught up),
//! it becomes the stream's new logical epoch and the head of the log before
//! it may be physically discarded.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::JournalError;
use crate::id::Vid;
use crate::journal::Journal;

/// Reserved event kind that opens a snapshot and is a legal replay epoch.
pub const SNAPSHOT_EPOCH_KIND: &str = "SnapshotBegin";

/// When the head of a stream may be discarded.
#[derive(Debug, Clone)]
pub struct TrimPolicy {
    /// How long a snapshot event must have been stable before it may become
    /// the new epoch. Bounds how much history must be retained to tolerate
    /// slow or crashed readers.
    pub min_epoch_age: Duration,
}

impl Default for TrimPolicy {
    fn default() -> Self {
        // One hour: generous for readers that re-scan at least every few
        // minutes, small enough to keep busy index streams bounded.
        TrimPolicy {
            min_epoch_age: Duration::from_secs(3_600),
        }
    }
}

impl Journal {
    /// Discard the head of a stream up to its newest stable snapshot epoch.
    ///
    /// Scans for the latest [`SNAPSHOT_EPOCH_KIND`] event older than
    /// `policy.min_epoch_age` and removes every event before it. The epoch
    /// event itself and everything after it are retained, so a subsequent
    /// `find(stream, EPOCH)` replays from the snapshot.
    ///
    /// # Returns
    ///
    /// `Some(vid)` of the new epoch event if anything was discarded,
    /// `None` if no eligible epoch exists or the head was already trimmed.
    ///
    /// # Errors
    ///
    /// [`JournalError::Closed`] after the journal shuts down.
    pub fn trim_stream(
        &self,
        stream: Uuid,
        policy: &TrimPolicy,
    ) -> Result<Option<Vid>, JournalError> {
        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| JournalError::Storage(format!("system clock before epoch: {e}")))?
            .as_millis() as u64;
        let min_age_millis = policy.min_epoch_age.as_millis() as u64;

        let mut inner = self.inner.lock().expect("journal lock poisoned");
        if inner.closed {
            return Err(JournalError::Closed);
        }
        let Some(slot) = inner.streams.get_mut(&stream) else {
            return Ok(None);
        };

        // Newest snapshot event old enough to be a stable epoch.
        let epoch_index = slot.events.iter().rposition(|e| {
            e.event_type == SNAPSHOT_EPOCH_KIND
                && e.id
                    .timestamp_millis()
                    .is_some_and(|ts| now_millis.saturating_sub(ts) >= min_age_millis)
        });

        match epoch_index {
            Some(index) if index > 0 => {
                let epoch = slot.events[index].id;
                slot.events.drain(..index);
                tracing::info!(
                    stream = %stream,
                    epoch = %epoch,
                    discarded = index,
                    "trimmed stream head"
                );
                Ok(Some(epoch))
            }
            // Epoch already at the head, or no eligible epoch at all.
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::EventId;
    use crate::journal::ProposedEvent;

    fn ev(kind: &str) -> ProposedEvent {
        ProposedEvent {
            event_type: kind.to_string(),
            data: serde_json::Value::Null,
        }
    }

    /// A policy under which any existing event is immediately stable.
    fn eager() -> TrimPolicy {
        TrimPolicy {
            min_epoch_age: Duration::ZERO,
        }
    }

    #[test]
    fn trim_discards_head_before_stable_epoch() {
        let journal = Journal::new();
        let stream = Uuid::new_v4();

        let v1 = journal
            .append(stream, EventId::EPOCH, vec![ev("A"), ev("B")])
            .unwrap();
        let v2 = journal
            .append(stream, v1, vec![ev(SNAPSHOT_EPOCH_KIND), ev("Dump"), ev("SnapshotEnd")])
            .unwrap();

        let epoch = journal
            .trim_stream(stream, &eager())
            .unwrap()
            .expect("a stable epoch should be found");

        let events = journal.find(stream, EventId::EPOCH).unwrap();
        assert_eq!(events.len(), 3, "A and B should be gone");
        assert_eq!(events[0].event_type, SNAPSHOT_EPOCH_KIND);
        assert_eq!(events[0].id, epoch);
        // The tail survives trimming.
        assert_eq!(journal.tail(stream).unwrap(), v2);
    }

    #[test]
    fn trim_without_snapshot_is_a_noop() {
        let journal = Journal::new();
        let stream = Uuid::new_v4();
        journal
            .append(stream, EventId::EPOCH, vec![ev("A")])
            .unwrap();

        assert!(journal.trim_stream(stream, &eager()).unwrap().is_none());
        assert_eq!(journal.find(stream, EventId::EPOCH).unwrap().len(), 1);
    }

    #[test]
    fn trim_respects_min_epoch_age() {
        let journal = Journal::new();
        let stream = Uuid::new_v4();
        let v1 = journal
            .append(stream, EventId::EPOCH, vec![ev("A")])
            .unwrap();
        journal
            .append(stream, v1, vec![ev(SNAPSHOT_EPOCH_KIND)])
            .unwrap();

        let patient = TrimPolicy {
            min_epoch_age: Duration::from_secs(3_600),
        };
        assert!(
            journal.trim_stream(stream, &patient).unwrap().is_none(),
            "a freshly written snapshot is not yet a stable epoch"
        );
        assert_eq!(journal.find(stream, EventId::EPOCH).unwrap().len(), 2);
    }

    #[test]
    fn second_trim_is_a_noop() {
        let journal = Journal::new();
        let stream = Uuid::new_v4();
        let v1 = journal
            .append(stream, EventId::EPOCH, vec![ev("A")])
            .unwrap();
        journal
            .append(stream, v1, vec![ev(SNAPSHOT_EPOCH_KIND), ev("SnapshotEnd")])
            .unwrap();

        assert!(journal.trim_stream(stream, &eager()).unwrap().is_some());
        assert!(
            journal.trim_stream(stream, &eager()).unwrap().is_none(),
            "epoch already at the head"
        );
    }

    #[test]
    fn newest_eligible_epoch_wins() {
        let journal = Journal::new();
        let stream = Uuid::new_v4();
        let v1 = journal
            .append(stream, EventId::EPOCH, vec![ev("A"), ev(SNAPSHOT_EPOCH_KIND)])
            .unwrap();
        journal
            .append(stream, v1, vec![ev("B"), ev(SNAPSHOT_EPOCH_KIND), ev("C")])
            .unwrap();

        journal.trim_stream(stream, &eager()).unwrap().unwrap();
        let events = journal.find(stream, EventId::EPOCH).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, SNAPSHOT_EPOCH_KIND);
        assert_eq!(events[1].event_type, "C");
    }
}
