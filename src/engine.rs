//! Generic state/event/command loop over the journal.
//!
//! Each aggregate type supplies three pieces through [`Behavior`]: how to
//! construct empty state (`Default`), how to validate a command into events
//! (`tell`), and how to fold one event into state (`advance`). The engine
//! adds replay-from-log reconstruction, optimistic concurrency on the
//! stream vid, and the idempotent-no-op contract: `tell` returning zero
//! events means "already satisfied", and the current vid is returned
//! unchanged with nothing appended.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::{EngineError, JournalError};
use crate::id::{EventId, Vid};
use crate::journal::{Event, Journal, ProposedEvent};

/// Internal retry budget for `RETRY_NO_VC` callers.
///
/// Such callers have declared their command replay-safe, so the engine
/// absorbs benign append races by reloading and re-telling instead of
/// surfacing a conflict the caller would ignore anyway.
const RETRY_NO_VC_ATTEMPTS: u32 = 3;

/// A domain aggregate's vocabulary and transition logic.
///
/// # Contract
///
/// - [`tell`](Behavior::tell) is a pure decision function: no I/O. It
///   returns `Ok(events)` on success, `Ok(vec![])` when the command's
///   effect is already reflected in the state (idempotent replay safety:
///   every exposed operation may be retried by a caller that cannot tell
///   whether a prior attempt succeeded), or `Err` when the command
///   conflicts with invariants.
/// - [`advance`](Behavior::advance) is a pure, total function over the
///   aggregate's own event kinds. Foreign kinds never reach it: decoding
///   is a fallible parse at load time, and an undecodable event fails the
///   load with [`EngineError::BadEvent`] rather than being skipped.
pub trait Behavior: Send + Sync + 'static {
    /// Identifies this aggregate type in logs (e.g. `"archive-repo"`).
    const AGGREGATE_TYPE: &'static str;

    /// The projection folded from the event stream.
    type State: Clone + Default + Send + Sync + 'static;

    /// The set of events this aggregate produces and folds. Must use
    /// adjacently tagged serde (`#[serde(tag = "type", content = "data")]`).
    type Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// The set of commands this aggregate accepts.
    type Command: Send + 'static;

    /// Validate a command against current state and produce events.
    fn tell(state: &Self::State, cmd: Self::Command) -> Result<Vec<Self::Event>, EngineError>;

    /// Fold a single event into state, producing the next state.
    fn advance(state: Self::State, event: &Self::Event) -> Self::State;
}

/// An immutable state snapshot plus the vid it was folded up to.
///
/// The state is behind an `Arc`: snapshots may be shared freely across
/// concurrent readers, and a later write produces a new snapshot rather
/// than mutating this one.
#[derive(Debug, Clone)]
pub struct Loaded<S> {
    /// The projection at `vid`.
    pub state: Arc<S>,
    /// Vid of the latest folded event; [`EventId::EPOCH`] for an aggregate
    /// never seen. Callers are free to treat epoch as an error or as valid
    /// empty state.
    pub vid: Vid,
}

/// Generic engine binding one [`Behavior`] to a journal.
///
/// `Clone` is cheap: the journal and the snapshot cache are `Arc`-shared.
pub struct Engine<B: Behavior> {
    journal: Journal,
    /// Last folded snapshot per stream. On reload the engine clones the
    /// cached state once and folds only events newer than its vid, so a
    /// warm load costs O(new events) instead of O(history). Cached `Arc`s
    /// already handed out stay valid to read.
    cache: Arc<Mutex<HashMap<Uuid, Loaded<B::State>>>>,
}

impl<B: Behavior> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Engine {
            journal: self.journal.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<B: Behavior> std::fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("aggregate_type", &B::AGGREGATE_TYPE)
            .finish()
    }
}

impl<B: Behavior> Engine<B> {
    /// Bind this behavior to a journal.
    pub fn new(journal: Journal) -> Engine<B> {
        Engine {
            journal,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The underlying journal.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Load a stream by replaying its events through `advance`.
    ///
    /// An aggregate never seen returns empty state with
    /// `vid == EventId::EPOCH`.
    ///
    /// # Errors
    ///
    /// [`EngineError::BadEvent`] if the stream contains an event this
    /// aggregate type cannot decode; journal failures pass through.
    pub fn find_id(&self, id: Uuid) -> Result<Loaded<B::State>, EngineError> {
        let cached = {
            let cache = self.cache.lock().expect("engine cache lock poisoned");
            cache.get(&id).cloned()
        };
        let base = cached.unwrap_or(Loaded {
            state: Arc::new(B::State::default()),
            vid: EventId::EPOCH,
        });

        let new_events = self.journal.find(id, base.vid)?;
        if new_events.is_empty() {
            return Ok(base);
        }

        // Copy-on-write: one clone per load, then fold in place.
        let mut state = (*base.state).clone();
        let mut vid = base.vid;
        for event in &new_events {
            let domain = decode_event::<B>(id, event)?;
            state = B::advance(state, &domain);
            vid = event.id;
        }

        let loaded = Loaded {
            state: Arc::new(state),
            vid,
        };
        let mut cache = self.cache.lock().expect("engine cache lock poisoned");
        cache.insert(id, loaded.clone());
        Ok(loaded)
    }

    /// Validate a command against current state and append the resulting
    /// events.
    ///
    /// Rejects with [`EngineError::VersionConflict`] if `expected` is
    /// neither the loaded vid nor a sentinel. Zero events from `tell`
    /// means the command is already satisfied; the current vid is returned
    /// unchanged and nothing is appended.
    ///
    /// With [`EventId::RETRY_NO_VC`], benign append races are absorbed by
    /// reloading and re-telling a bounded number of times.
    pub fn tell_id_vid(&self, id: Uuid, expected: Vid, cmd: B::Command) -> Result<Vid, EngineError>
    where
        B::Command: Clone,
    {
        let attempts = if expected == EventId::RETRY_NO_VC {
            RETRY_NO_VC_ATTEMPTS
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.tell_once(id, expected, cmd.clone()) {
                Err(EngineError::VersionConflict { .. }) if attempt < attempts => {
                    tracing::debug!(
                        aggregate_type = B::AGGREGATE_TYPE,
                        id = %id,
                        attempt,
                        "benign append race, reloading"
                    );
                }
                other => return other,
            }
        }
    }

    fn tell_once(&self, id: Uuid, expected: Vid, cmd: B::Command) -> Result<Vid, EngineError> {
        let _span =
            tracing::info_span!("tell", aggregate_type = B::AGGREGATE_TYPE, id = %id).entered();

        let loaded = self.find_id(id)?;
        if !expected.is_sentinel() && expected != loaded.vid {
            return Err(EngineError::VersionConflict {
                expected,
                actual: loaded.vid,
            });
        }

        let events = B::tell(&loaded.state, cmd)?;
        if events.is_empty() {
            // Idempotent no-op: already satisfied.
            return Ok(loaded.vid);
        }

        let proposed: Vec<ProposedEvent> = events.iter().map(encode_event::<B>).collect();
        let new_vid = match self.journal.append(id, loaded.vid, proposed) {
            Ok(vid) => vid,
            // A writer slipped in between our load and the append.
            Err(JournalError::VersionConflict { actual, .. }) => {
                return Err(EngineError::VersionConflict {
                    expected: loaded.vid,
                    actual,
                });
            }
            Err(e) => return Err(e.into()),
        };

        // Advance the cached snapshot past the events we just wrote.
        let mut state = (*loaded.state).clone();
        for event in &events {
            state = B::advance(state, event);
        }
        let mut cache = self.cache.lock().expect("engine cache lock poisoned");
        cache.insert(
            id,
            Loaded {
                state: Arc::new(state),
                vid: new_vid,
            },
        );

        tracing::info!(
            aggregate_type = B::AGGREGATE_TYPE,
            id = %id,
            count = events.len(),
            vid = %new_vid,
            "events appended"
        );
        Ok(new_vid)
    }

    /// Apply a terminal "may this aggregate be forgotten" command.
    ///
    /// Same contract as [`tell_id_vid`](Engine::tell_id_vid); a true delete
    /// is inferred from `tell` returning zero events from a state that
    /// represents "nothing to do".
    pub fn delete_id_vid(
        &self,
        id: Uuid,
        expected: Vid,
        cmd: B::Command,
    ) -> Result<(), EngineError>
    where
        B::Command: Clone,
    {
        self.tell_id_vid(id, expected, cmd).map(|_| ())
    }
}

/// Serialize an adjacently tagged domain event into a journal envelope.
fn encode_event<B: Behavior>(event: &B::Event) -> ProposedEvent {
    let value = serde_json::to_value(event)
        .expect("domain events must serialize to JSON without fallible state");
    let obj = value
        .as_object()
        .expect("adjacently tagged enum must serialize to a JSON object");
    let event_type = obj["type"]
        .as_str()
        .expect("adjacently tagged enum must have a string 'type' field")
        .to_string();
    // Absent for fieldless variants.
    let data = obj.get("data").cloned().unwrap_or(serde_json::Value::Null);
    ProposedEvent { event_type, data }
}

/// Parse a journal envelope back into the aggregate's event kind.
fn decode_event<B: Behavior>(stream: Uuid, event: &Event) -> Result<B::Event, EngineError> {
    let tagged = if event.data.is_null() {
        serde_json::json!({ "type": event.event_type })
    } else {
        serde_json::json!({ "type": event.event_type, "data": event.data })
    };
    serde_json::from_value::<B::Event>(tagged).map_err(|e| EngineError::BadEvent {
        stream,
        id: event.id,
        detail: e.to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{TallyBehavior, TallyCommand, TallyEvent};
    use super::*;

    fn engine() -> Engine<TallyBehavior> {
        Engine::new(Journal::new())
    }

    #[test]
    fn find_unknown_aggregate_returns_epoch_and_empty_state() {
        let engine = engine();
        let loaded = engine.find_id(Uuid::new_v4()).expect("load should succeed");
        assert_eq!(loaded.vid, EventId::EPOCH);
        assert_eq!(loaded.state.name, None);
        assert_eq!(loaded.state.total, 0);
    }

    #[test]
    fn tell_appends_and_advances_state() {
        let engine = engine();
        let id = Uuid::new_v4();

        let v1 = engine
            .tell_id_vid(id, EventId::EPOCH, TallyCommand::Init { name: "a".into() })
            .expect("init should succeed");
        let v2 = engine
            .tell_id_vid(id, v1, TallyCommand::Add { amount: 5 })
            .expect("add should succeed");
        assert!(v2 > v1);

        let loaded = engine.find_id(id).unwrap();
        assert_eq!(loaded.vid, v2);
        assert_eq!(loaded.state.name.as_deref(), Some("a"));
        assert_eq!(loaded.state.total, 5);
    }

    #[test]
    fn idempotent_replay_returns_current_vid_without_new_events() {
        let engine = engine();
        let id = Uuid::new_v4();

        let v1 = engine
            .tell_id_vid(id, EventId::EPOCH, TallyCommand::Init { name: "a".into() })
            .unwrap();
        // Same command, unchanged vid: zero events, same vid back.
        let v2 = engine
            .tell_id_vid(id, v1, TallyCommand::Init { name: "a".into() })
            .expect("idempotent replay must not error");
        assert_eq!(v2, v1);
        assert_eq!(engine.journal().find(id, EventId::EPOCH).unwrap().len(), 1);
    }

    #[test]
    fn conflicting_replay_is_not_idempotent() {
        let engine = engine();
        let id = Uuid::new_v4();

        let v1 = engine
            .tell_id_vid(id, EventId::EPOCH, TallyCommand::Init { name: "a".into() })
            .unwrap();
        let err = engine
            .tell_id_vid(id, v1, TallyCommand::Init { name: "b".into() })
            .expect_err("different arguments must hard-conflict");
        assert!(matches!(err, EngineError::NotIdempotent { .. }));
    }

    #[test]
    fn stale_vid_is_rejected() {
        let engine = engine();
        let id = Uuid::new_v4();

        let v1 = engine
            .tell_id_vid(id, EventId::EPOCH, TallyCommand::Init { name: "a".into() })
            .unwrap();
        engine
            .tell_id_vid(id, v1, TallyCommand::Add { amount: 1 })
            .unwrap();

        let err = engine
            .tell_id_vid(id, v1, TallyCommand::Add { amount: 1 })
            .expect_err("stale vid must conflict");
        assert!(matches!(err, EngineError::VersionConflict { .. }));
    }

    #[test]
    fn no_vc_sentinel_skips_the_version_check() {
        let engine = engine();
        let id = Uuid::new_v4();

        engine
            .tell_id_vid(id, EventId::EPOCH, TallyCommand::Init { name: "a".into() })
            .unwrap();
        engine
            .tell_id_vid(id, EventId::NO_VC, TallyCommand::Add { amount: 2 })
            .expect("NO_VC should accept any current vid");
        assert_eq!(engine.find_id(id).unwrap().state.total, 2);
    }

    #[test]
    fn replay_is_deterministic() {
        let engine = engine();
        let id = Uuid::new_v4();
        let v1 = engine
            .tell_id_vid(id, EventId::EPOCH, TallyCommand::Init { name: "a".into() })
            .unwrap();
        engine
            .tell_id_vid(id, v1, TallyCommand::Add { amount: 3 })
            .unwrap();

        // A second engine over the same journal cold-replays to an equal
        // projection.
        let fresh: Engine<TallyBehavior> = Engine::new(engine.journal().clone());
        let a = engine.find_id(id).unwrap();
        let b = fresh.find_id(id).unwrap();
        assert_eq!(*a.state, *b.state);
        assert_eq!(a.vid, b.vid);
    }

    #[test]
    fn concurrent_writers_on_the_same_stale_vid_race_to_one_winner() {
        let journal = Journal::new();
        let a: Engine<TallyBehavior> = Engine::new(journal.clone());
        let b: Engine<TallyBehavior> = Engine::new(journal);
        let id = Uuid::new_v4();

        let vid = a
            .tell_id_vid(id, EventId::EPOCH, TallyCommand::Init { name: "x".into() })
            .unwrap();

        let first = a.tell_id_vid(id, vid, TallyCommand::Add { amount: 1 });
        let second = b.tell_id_vid(id, vid, TallyCommand::Add { amount: 1 });
        assert!(first.is_ok(), "first writer should win");
        assert!(
            matches!(second, Err(EngineError::VersionConflict { .. })),
            "loser must see a version conflict, got: {second:?}"
        );
    }

    #[test]
    fn foreign_event_kind_fails_the_load() {
        let journal = Journal::new();
        let engine: Engine<TallyBehavior> = Engine::new(journal.clone());
        let id = Uuid::new_v4();
        journal
            .append(
                id,
                EventId::EPOCH,
                vec![crate::journal::ProposedEvent {
                    event_type: "NotATallyEvent".into(),
                    data: serde_json::Value::Null,
                }],
            )
            .unwrap();

        let err = engine.find_id(id).expect_err("foreign kind must fail");
        assert!(matches!(err, EngineError::BadEvent { .. }));
    }

    #[test]
    fn encode_decode_bridge_roundtrips() {
        let event = TallyEvent::Added { amount: 7 };
        let proposed = encode_event::<TallyBehavior>(&event);
        assert_eq!(proposed.event_type, "Added");

        let stored = Event {
            id: EventId::new(),
            parent: EventId::EPOCH,
            event_type: proposed.event_type,
            data: proposed.data,
        };
        let back = decode_event::<TallyBehavior>(Uuid::nil(), &stored).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn fieldless_variants_encode_with_null_data() {
        // TallyEvent has no fieldless variants; check via raw journal shape
        // that null data decodes as a bare tag.
        let stored = Event {
            id: EventId::new(),
            parent: EventId::EPOCH,
            event_type: "Added".into(),
            data: serde_json::json!({ "amount": 1 }),
        };
        let back = decode_event::<TallyBehavior>(Uuid::nil(), &stored).unwrap();
        assert_eq!(back, TallyEvent::Added { amount: 1 });
    }
}
