//! Append-only event journal: one logical stream-of-streams.
//!
//! Many aggregate identities share a journal but are read independently by
//! identity. The journal offers compare-and-swap appends against a stream's
//! tail vid, ordered reads after a cursor, best-effort coalesced change
//! notifications, and (together with [`crate::trim`]) snapshot-epoch head
//! trimming.
//!
//! This is the in-process reference implementation; the durable backend is
//! an external collaborator reachable through the same surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::JournalError;
use crate::id::{EventId, Vid};

/// An immutable, strictly ordered record in a stream.
///
/// `parent` equals the `id` of the event immediately preceding it in the
/// same stream, forming the causal chain that detects concurrent writers.
/// The payload is split into a `event_type` tag and a JSON `data` body, the
/// self-describing, schema-evolvable shape every aggregate's adjacently
/// tagged event enum serializes into.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Event {
    /// Time-sortable, per-stream monotonically increasing id.
    pub id: EventId,
    /// Id of the preceding event in the stream, or [`EventId::EPOCH`] for
    /// the first event.
    pub parent: EventId,
    /// Event kind tag (the `"type"` of the adjacently tagged domain enum).
    pub event_type: String,
    /// JSON payload (the `"data"` portion; null for fieldless kinds).
    pub data: serde_json::Value,
}

/// An event as produced by an aggregate, before the journal assigns
/// `id`/`parent`.
#[derive(Debug, Clone)]
pub struct ProposedEvent {
    /// Event kind tag.
    pub event_type: String,
    /// JSON payload.
    pub data: serde_json::Value,
}

/// One aggregate identity's slice of the journal.
#[derive(Debug, Default)]
pub(crate) struct Stream {
    /// Retained events, oldest first. Trimming removes the head; the tail
    /// is never trimmed, so the stream's vid survives compaction.
    pub(crate) events: Vec<Event>,
}

impl Stream {
    /// The stream's current tail vid, or [`EventId::EPOCH`] if empty.
    pub(crate) fn tail(&self) -> Vid {
        self.events.last().map(|e| e.id).unwrap_or(EventId::EPOCH)
    }
}

/// A registered wake-up channel for one stream.
struct Subscription {
    tx: mpsc::Sender<Uuid>,
    stream: Uuid,
}

pub(crate) struct Inner {
    pub(crate) streams: HashMap<Uuid, Stream>,
    subscriptions: Vec<Subscription>,
    pub(crate) closed: bool,
}

/// Durable, appendable, subscribable storage for event streams.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped, so every daemon
/// task in the process shares one journal.
#[derive(Clone)]
pub struct Journal {
    pub(crate) inner: Arc<Mutex<Inner>>,
    /// Appends push the advanced stream id here; `serve` pumps it out to
    /// subscribers. Unbounded: the pump coalesces on the subscriber side.
    change_tx: mpsc::UnboundedSender<Uuid>,
    change_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Uuid>>>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("journal lock poisoned");
        f.debug_struct("Journal")
            .field("streams", &inner.streams.len())
            .field("subscriptions", &inner.subscriptions.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl Journal {
    /// Create an empty journal.
    pub fn new() -> Journal {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        Journal {
            inner: Arc::new(Mutex::new(Inner {
                streams: HashMap::new(),
                subscriptions: Vec::new(),
                closed: false,
            })),
            change_tx,
            change_rx: Arc::new(tokio::sync::Mutex::new(change_rx)),
        }
    }

    /// Atomically append events to a stream.
    ///
    /// The append succeeds only if the stream's current tail equals
    /// `parent`, or `parent` is one of the version-check sentinels
    /// ([`EventId::NO_VC`], [`EventId::RETRY_NO_VC`]). A fresh stream's
    /// tail is [`EventId::EPOCH`].
    ///
    /// # Returns
    ///
    /// The new tail vid (the id of the last appended event).
    ///
    /// # Errors
    ///
    /// [`JournalError::VersionConflict`] if the tail check fails,
    /// [`JournalError::Closed`] after [`close`](Journal::close), and
    /// [`JournalError::Storage`] if `events` is empty (an append must
    /// advance the stream).
    pub fn append(
        &self,
        stream: Uuid,
        parent: Vid,
        events: Vec<ProposedEvent>,
    ) -> Result<Vid, JournalError> {
        if events.is_empty() {
            return Err(JournalError::Storage(
                "append requires at least one event".into(),
            ));
        }

        let new_tail = {
            let mut inner = self.inner.lock().expect("journal lock poisoned");
            if inner.closed {
                return Err(JournalError::Closed);
            }
            let slot = inner.streams.entry(stream).or_default();
            let tail = slot.tail();
            if !parent.is_sentinel() && parent != tail {
                return Err(JournalError::VersionConflict {
                    stream,
                    expected: parent,
                    actual: tail,
                });
            }

            let mut prev = tail;
            for proposed in events {
                let id = mint_above(prev);
                slot.events.push(Event {
                    id,
                    parent: prev,
                    event_type: proposed.event_type,
                    data: proposed.data,
                });
                prev = id;
            }
            prev
        };

        // Wake the serve pump outside the lock. If no pump is running the
        // send still succeeds (unbounded) and watchers fall back to their
        // periodic tick.
        let _ = self.change_tx.send(stream);
        tracing::debug!(stream = %stream, vid = %new_tail, "appended");
        Ok(new_tail)
    }

    /// Read events with `id > after`, ordered by id.
    ///
    /// Restartable: callers keep the last seen id as their cursor and pass
    /// it back on the next call. [`EventId::EPOCH`] reads from the start of
    /// retained (possibly trimmed) history. An unknown stream yields an
    /// empty batch.
    pub fn find(&self, stream: Uuid, after: Vid) -> Result<Vec<Event>, JournalError> {
        let inner = self.inner.lock().expect("journal lock poisoned");
        if inner.closed {
            return Err(JournalError::Closed);
        }
        let Some(slot) = inner.streams.get(&stream) else {
            return Ok(Vec::new());
        };
        // Events are sorted by id; skip the prefix at or below the cursor.
        let start = slot.events.partition_point(|e| e.id <= after);
        Ok(slot.events[start..].to_vec())
    }

    /// The stream's current tail vid ([`EventId::EPOCH`] if never written).
    pub fn tail(&self, stream: Uuid) -> Result<Vid, JournalError> {
        let inner = self.inner.lock().expect("journal lock poisoned");
        if inner.closed {
            return Err(JournalError::Closed);
        }
        Ok(inner
            .streams
            .get(&stream)
            .map(|s| s.tail())
            .unwrap_or(EventId::EPOCH))
    }

    /// Discard a stream entirely, retained events and all.
    ///
    /// Unlike trimming, nothing survives: afterwards the id reads as never
    /// written (empty `find`, [`EventId::EPOCH`] tail). Dropping an unknown
    /// stream is a no-op. Used by the garbage collector once a deleted
    /// workflow has left the index, so terminated streams do not accumulate
    /// for the life of the process.
    pub fn drop_stream(&self, stream: Uuid) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        if inner.closed {
            return Err(JournalError::Closed);
        }
        if inner.streams.remove(&stream).is_some() {
            tracing::debug!(stream = %stream, "stream dropped");
        }
        Ok(())
    }

    /// Register a best-effort wake-up channel for a stream.
    ///
    /// Delivery is at-least-once and coalesced: the pump uses `try_send`,
    /// so a flooded channel drops duplicate wake-ups. Losing duplicates is
    /// safe because the reader always re-scans from its last cursor.
    /// Subscribe *before* the first read to avoid missing an event written
    /// between read and subscribe.
    pub fn subscribe(&self, tx: mpsc::Sender<Uuid>, stream: Uuid) {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        inner.subscriptions.push(Subscription { tx, stream });
    }

    /// Remove every subscription registered on the given channel.
    pub fn unsubscribe(&self, tx: &mpsc::Sender<Uuid>) {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        inner.subscriptions.retain(|s| !s.tx.same_channel(tx));
    }

    /// Pump change notifications to subscribers until cancelled.
    ///
    /// Must run for watched reads to see low-latency wake-ups; without it,
    /// watchers make progress only on their fallback tick. Blocks until
    /// `cancel` flips to `true`, which is a clean exit, not a failure.
    ///
    /// # Errors
    ///
    /// [`JournalError::Closed`] if a second `serve` is already holding the
    /// pump, or if the journal closes while serving.
    pub async fn serve(&self, mut cancel: watch::Receiver<bool>) -> Result<(), JournalError> {
        let mut rx = self
            .change_rx
            .try_lock()
            .map_err(|_| JournalError::Closed)?;

        // `changed` never fires for a value set before we subscribed.
        if *cancel.borrow() {
            tracing::info!("journal serve loop stopping");
            return Ok(());
        }

        loop {
            tokio::select! {
                changed = rx.recv() => {
                    match changed {
                        Some(stream) => self.notify(stream),
                        // All senders gone: the journal itself was dropped.
                        None => return Err(JournalError::Closed),
                    }
                }
                res = cancel.changed() => {
                    if res.is_err() || *cancel.borrow() {
                        tracing::info!("journal serve loop stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Fan a wake-up out to the stream's subscribers, dropping dead ones.
    fn notify(&self, stream: Uuid) {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        inner.subscriptions.retain(|sub| {
            if sub.stream != stream {
                return true;
            }
            match sub.tx.try_send(stream) {
                Ok(()) => true,
                // Full channel: the wake-up coalesces with the pending one.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                // Receiver dropped: forget the subscription.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Mark the journal closed; subsequent operations fail with
    /// [`JournalError::Closed`]. Used when the owning process decides a
    /// broken storage connection should stop serving rather than serve
    /// stale reads.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        inner.closed = true;
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

/// Mint a fresh v7 id strictly above `tail`.
///
/// Two v7 ids minted within the same millisecond are not ordered by their
/// random bits, so re-mint until the new id sorts above the stream tail.
fn mint_above(tail: Vid) -> EventId {
    loop {
        let id = EventId::new();
        if id > tail {
            return id;
        }
    }
}
