//! Identities and version tokens.
//!
//! Every aggregate instance (a registry, a repo, a workflow run, a workflow
//! index) is identified by a stable UUID. Event ids are UUID v7 values, so
//! they sort by creation time and double as the stream's logical clock.

use uuid::Uuid;

/// Fixed namespace UUID for deterministic aggregate ID derivation.
///
/// Named aggregates (registries, repos, per-registry indexes) map to UUID v5
/// values derived from this namespace and a `"{kind}/{name}"` string, so the
/// same name always yields the same aggregate identity in every process.
const AGGREGATE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5f, 0x2b, 0x91, 0x6e, 0xd0, 0x4c, 0x47, 0xa1, 0x8d, 0x33, 0x6b, 0x0e, 0xf2, 0x5c, 0x19, 0x77,
]);

/// Derive a deterministic aggregate ID from a kind and a human-readable name.
///
/// Uses UUID v5 (SHA-1 based) with a fixed crate namespace, so the mapping is
/// stable across processes and releases.
///
/// # Examples
///
/// ```
/// use repoflow::aggregate_id;
/// let a = aggregate_id("registry", "exreg");
/// assert_eq!(a, aggregate_id("registry", "exreg"));
/// assert_ne!(a, aggregate_id("repo", "exreg"));
/// ```
pub fn aggregate_id(kind: &str, name: &str) -> Uuid {
    let name = format!("{kind}/{name}");
    Uuid::new_v5(&AGGREGATE_NAMESPACE, name.as_bytes())
}

/// Generate a random, time-sortable workflow run ID.
///
/// UUID v7 embeds the creation time, which the garbage collector later reads
/// back via [`EventId::timestamp_millis`] on the workflow's first event to
/// decide whether a run has exceeded its max-active window.
pub fn workflow_id() -> Uuid {
    Uuid::now_v7()
}

/// A time-sortable event identifier.
///
/// Within one stream, ids are strictly increasing and each event's `parent`
/// equals the id of the event before it. The id of a stream's latest event is
/// also the stream's version token (see [`Vid`]), used for optimistic
/// concurrency.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct EventId(Uuid);

/// Version token of a stream: the id of its latest applied event.
///
/// Two sentinel values relax the optimistic-concurrency check:
/// [`Vid::NO_VC`] accepts any current tail, and [`Vid::RETRY_NO_VC`] does the
/// same while signaling that the caller retries indefinitely, so benign races
/// need not be surfaced to it.
pub type Vid = EventId;

impl EventId {
    /// The epoch sentinel: "no events yet / uninitialized stream".
    ///
    /// Also the cursor value that means "read from the start of (trimmed)
    /// history" when passed to `Journal::find`.
    pub const EPOCH: EventId = EventId(Uuid::nil());

    /// Version-check sentinel: accept whatever the current tail is.
    pub const NO_VC: EventId = EventId(Uuid::max());

    /// Like [`EventId::NO_VC`], but the caller intends to retry forever.
    ///
    /// Used for idempotent background posts (index updates, GC commands)
    /// where a lost race will simply be retried on the next pass.
    pub const RETRY_NO_VC: EventId = EventId(Uuid::from_u128(u128::MAX - 1));

    /// Mint a fresh time-sortable event id.
    pub fn new() -> EventId {
        EventId(Uuid::now_v7())
    }

    /// Wrap an existing UUID as an event id.
    pub const fn from_uuid(id: Uuid) -> EventId {
        EventId(id)
    }

    /// The underlying UUID.
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Whether this value is one of the version-check sentinels.
    pub fn is_sentinel(&self) -> bool {
        *self == Self::NO_VC || *self == Self::RETRY_NO_VC
    }

    /// Milliseconds since the Unix epoch embedded in a v7 id.
    ///
    /// Returns `None` for sentinels and non-v7 values.
    pub fn timestamp_millis(&self) -> Option<u64> {
        let ts = self.0.get_timestamp()?;
        let (secs, nanos) = ts.to_unix();
        Some(secs * 1_000 + u64::from(nanos) / 1_000_000)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_id_is_deterministic() {
        let a = aggregate_id("registry", "exreg");
        let b = aggregate_id("registry", "exreg");
        assert_eq!(a, b, "same inputs must produce the same UUID");
    }

    #[test]
    fn aggregate_id_differs_by_kind_and_name() {
        assert_ne!(aggregate_id("registry", "a"), aggregate_id("registry", "b"));
        assert_ne!(aggregate_id("registry", "a"), aggregate_id("repo", "a"));
    }

    #[test]
    fn event_ids_sort_by_creation_order() {
        let a = EventId::new();
        let b = EventId::new();
        assert!(a < b, "v7 ids minted later must sort greater");
    }

    #[test]
    fn sentinels_are_distinct_and_detected() {
        assert!(EventId::NO_VC.is_sentinel());
        assert!(EventId::RETRY_NO_VC.is_sentinel());
        assert!(!EventId::EPOCH.is_sentinel());
        assert!(!EventId::new().is_sentinel());
        assert_ne!(EventId::NO_VC, EventId::RETRY_NO_VC);
    }

    #[test]
    fn sentinels_sort_above_any_real_id() {
        let real = EventId::new();
        assert!(real < EventId::RETRY_NO_VC);
        assert!(real < EventId::NO_VC);
    }

    #[test]
    fn timestamp_is_recoverable_from_v7_ids() {
        let before = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let id = EventId::new();
        let ts = id.timestamp_millis().expect("v7 id carries a timestamp");
        assert!(ts + 1_000 >= before, "timestamp should be roughly now");
    }

    #[test]
    fn epoch_has_no_timestamp() {
        assert_eq!(EventId::EPOCH.timestamp_millis(), None);
    }

    #[test]
    fn event_id_serde_is_transparent() {
        let id = EventId::new();
        let json = serde_json::to_string(&id).expect("serialize should succeed");
        let back: EventId = serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(id, back);
        // Transparent: serializes as a bare UUID string.
        assert!(json.starts_with('"') && json.ends_with('"'));
    }
}
