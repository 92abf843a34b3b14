//! Cancellable watch loop over a single stream.
//!
//! The only coordination channel between daemons is "watch the stream, see
//! a new event, react". This module packages the loop every watcher needs:
//! subscribe *before* the first read (so an event written between read and
//! subscribe is never missed), then suspend on a wake-up OR a periodic
//! fallback tick OR cancellation. The fallback tick re-scans
//! unconditionally, guaranteeing forward progress even if a coalesced
//! wake-up was dropped.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::JournalError;
use crate::id::{EventId, Vid};
use crate::journal::{Event, Journal};

/// Tuning for a watch loop.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Cursor to start reading after; [`EventId::EPOCH`] replays retained
    /// history first.
    pub after: Vid,
    /// How often to re-scan even without a wake-up.
    pub fallback_tick: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            after: EventId::EPOCH,
            fallback_tick: Duration::from_secs(10),
        }
    }
}

/// Watch a stream, invoking `on_events` for every batch of new events.
///
/// The callback returns [`ControlFlow::Break`] to stop watching (the
/// "wait for result" pattern: a client breaks once it has seen the event
/// it was waiting for). Cancellation exits with `Ok(())`: "told to stop"
/// is never classified as failure, which the owning process uses to decide
/// whether a crash-level log/exit is warranted.
///
/// # Errors
///
/// Journal failures (closed, storage) propagate; the loop never retries
/// them itself.
pub async fn watch_stream<F>(
    journal: &Journal,
    stream: Uuid,
    config: WatchConfig,
    mut cancel: watch::Receiver<bool>,
    mut on_events: F,
) -> Result<(), JournalError>
where
    F: FnMut(&[Event]) -> ControlFlow<()>,
{
    // Subscribe before the first read. Capacity 1 is enough: wake-ups
    // coalesce, and we always re-scan from the cursor.
    let (tx, mut wakeups) = mpsc::channel(1);
    journal.subscribe(tx.clone(), stream);

    let result = async {
        // `changed` never fires for a value set before we subscribed.
        if *cancel.borrow() {
            tracing::debug!(stream = %stream, "watch loop cancelled");
            return Ok(());
        }

        let mut cursor = config.after;
        let mut tick = tokio::time::interval(config.fallback_tick);
        // The first interval tick completes immediately; consume it so the
        // initial scan below is not double-counted.
        tick.tick().await;

        loop {
            let events = journal.find(stream, cursor)?;
            if let Some(last) = events.last() {
                cursor = last.id;
                if on_events(&events).is_break() {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = wakeups.recv() => {}
                _ = tick.tick() => {}
                res = cancel.changed() => {
                    if res.is_err() || *cancel.borrow() {
                        tracing::debug!(stream = %stream, "watch loop cancelled");
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;

    journal.unsubscribe(&tx);
    result
}
