//! Append-only event store with per-aggregate ordering and snapshots.
//!
//! The store keeps one ordered log per aggregate behind a single
//! `tokio::sync::RwLock`, which serializes concurrent appends for the same
//! aggregate and preserves the per-aggregate total order. An optional
//! journal directory adds crash durability: every accepted event is written
//! as one JSON line, and [`EventStore::open`] replays the journal on start.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AppendError;
use crate::event::{EventType, LearningEvent};

/// Fixed namespace UUID for deterministic stream file naming.
///
/// Aggregate ids are caller-supplied strings and may not be filesystem
/// safe, so journal files are named by the UUID v5 of the aggregate id
/// under this namespace. The same aggregate always maps to the same
/// stream file, regardless of which process performs the mapping.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5d, 0x02, 0xb7, 0x91, 0x8c, 0x44, 0x4e, 0x1a, 0x9f, 0x27, 0x63, 0x0e, 0xa4, 0x51, 0xd8, 0x3f,
]);

/// Derive a deterministic stream UUID from an aggregate id.
pub fn stream_uuid(aggregate_id: &str) -> Uuid {
    Uuid::new_v5(&STREAM_NAMESPACE, aggregate_id.as_bytes())
}

/// Outcome of an append call.
///
/// `duplicate` is `true` when the store had already seen `event_id` and
/// the call was a no-op. Duplicate appends are not errors: they are how
/// at-least-once delivery upstream becomes effectively-once downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The id of the stored event (the existing one on duplicates).
    pub event_id: Uuid,
    /// Whether this append was deduplicated against an earlier one.
    pub duplicate: bool,
}

/// A point-in-time cache of a projection fold over one aggregate.
///
/// Purely an optimization: rebuilding from events-only must always equal
/// rebuilding from `snapshot + events-after-snapshot`. Taking a snapshot
/// never truncates the underlying log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// The aggregate the snapshot belongs to.
    pub aggregate_id: String,
    /// When the snapshot was recorded.
    pub taken_at: DateTime<Utc>,
    /// How many events of the aggregate's log were folded into the state.
    /// Callers resume the fold from this index.
    pub events_applied: usize,
    /// The projection state at snapshot time, type-erased to JSON.
    pub derived_state: Value,
}

/// Mutable store internals, guarded by one `RwLock`.
///
/// `streams` is a `BTreeMap` so cross-aggregate scans iterate in a
/// deterministic key order.
#[derive(Debug, Default)]
struct StoreInner {
    streams: BTreeMap<String, Vec<LearningEvent>>,
    seen_ids: HashSet<Uuid>,
    snapshots: BTreeMap<String, StateSnapshot>,
}

/// Append-only, per-aggregate ordered log of immutable domain events.
///
/// Constructed once at process start and shared by reference; fresh
/// instances make unit tests hermetic. Events are never updated or
/// deleted once appended.
#[derive(Debug)]
pub struct EventStore {
    inner: RwLock<StoreInner>,
    journal_dir: Option<PathBuf>,
}

impl EventStore {
    /// Create an in-memory store with no journal.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            journal_dir: None,
        }
    }

    /// Open a journal-backed store rooted at `dir`, replaying any
    /// existing journal files into memory.
    ///
    /// Layout: `<dir>/streams/<stream_uuid>.jsonl` for event logs and
    /// `<dir>/snapshots/<stream_uuid>.json` for snapshot caches.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Io`] if the directories cannot be created
    /// or a journal file cannot be read. A corrupt journal line is
    /// skipped with a warning rather than failing the open.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, AppendError> {
        let dir = dir.as_ref().to_path_buf();
        let streams_dir = dir.join("streams");
        let snapshots_dir = dir.join("snapshots");
        std::fs::create_dir_all(&streams_dir)?;
        std::fs::create_dir_all(&snapshots_dir)?;

        let mut inner = StoreInner::default();
        for entry in std::fs::read_dir(&streams_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            replay_journal_file(&path, &mut inner)?;
        }
        for entry in std::fs::read_dir(&snapshots_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_snapshot_file(&path) {
                Some(snapshot) => {
                    inner
                        .snapshots
                        .insert(snapshot.aggregate_id.clone(), snapshot);
                }
                None => continue,
            }
        }

        tracing::info!(
            dir = %dir.display(),
            aggregates = inner.streams.len(),
            "event store journal replayed"
        );
        Ok(Self {
            inner: RwLock::new(inner),
            journal_dir: Some(dir),
        })
    }

    /// Append an event to its aggregate's log.
    ///
    /// Idempotent: if `event_id` was already appended, nothing is written
    /// and the outcome reports `duplicate: true`. The event's timestamp is
    /// clamped so it never precedes the previous event of the same
    /// aggregate, preserving the monotonic-timestamp invariant.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError`] only for journal I/O or serialization
    /// failures; in-memory appends cannot fail.
    pub async fn append(&self, mut event: LearningEvent) -> Result<AppendOutcome, AppendError> {
        let mut inner = self.inner.write().await;

        if inner.seen_ids.contains(&event.event_id) {
            tracing::debug!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "duplicate append ignored"
            );
            return Ok(AppendOutcome {
                event_id: event.event_id,
                duplicate: true,
            });
        }

        let stream = inner.streams.entry(event.aggregate_id.clone()).or_default();
        if let Some(last) = stream.last() {
            if event.timestamp < last.timestamp {
                event.timestamp = last.timestamp;
            }
        }

        if let Some(dir) = &self.journal_dir {
            append_journal_line(dir, &event)?;
        }

        tracing::debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            "event appended"
        );
        let event_id = event.event_id;
        stream.push(event);
        inner.seen_ids.insert(event_id);
        Ok(AppendOutcome {
            event_id,
            duplicate: false,
        })
    }

    /// Return an aggregate's events in append order.
    ///
    /// An unknown aggregate yields an empty vec, not an error.
    pub async fn query(&self, aggregate_id: &str) -> Vec<LearningEvent> {
        let inner = self.inner.read().await;
        inner.streams.get(aggregate_id).cloned().unwrap_or_default()
    }

    /// Return an aggregate's events whose timestamps fall in `[from, to]`.
    ///
    /// Either bound may be `None` for an open end. An empty range yields
    /// an empty vec.
    pub async fn query_range(
        &self,
        aggregate_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<LearningEvent> {
        let inner = self.inner.read().await;
        let Some(stream) = inner.streams.get(aggregate_id) else {
            return Vec::new();
        };
        stream
            .iter()
            .filter(|e| from.map_or(true, |f| e.timestamp >= f))
            .filter(|e| to.map_or(true, |t| e.timestamp <= t))
            .cloned()
            .collect()
    }

    /// Cross-aggregate scan for all events of one type.
    ///
    /// Used for analytics, not on any latency-critical path. Aggregates
    /// are visited in deterministic key order; within an aggregate the
    /// append order is preserved.
    pub async fn query_by_type(&self, event_type: EventType) -> Vec<LearningEvent> {
        let inner = self.inner.read().await;
        inner
            .streams
            .values()
            .flat_map(|stream| stream.iter().filter(|e| e.event_type == event_type))
            .cloned()
            .collect()
    }

    /// Record a snapshot of an aggregate's derived state.
    ///
    /// The snapshot captures the current log length so a later fold can
    /// resume from `events_applied`. The log itself is never truncated.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Io`] if persisting the snapshot file fails.
    pub async fn snapshot(&self, aggregate_id: &str, derived_state: Value) -> Result<(), AppendError> {
        let mut inner = self.inner.write().await;
        let events_applied = inner
            .streams
            .get(aggregate_id)
            .map(Vec::len)
            .unwrap_or(0);
        let snapshot = StateSnapshot {
            aggregate_id: aggregate_id.to_string(),
            taken_at: Utc::now(),
            events_applied,
            derived_state,
        };
        if let Some(dir) = &self.journal_dir {
            save_snapshot_file(dir, &snapshot)?;
        }
        inner.snapshots.insert(aggregate_id.to_string(), snapshot);
        Ok(())
    }

    /// Load the cached snapshot for an aggregate, if one was taken.
    pub async fn load_snapshot(&self, aggregate_id: &str) -> Option<StateSnapshot> {
        let inner = self.inner.read().await;
        inner.snapshots.get(aggregate_id).cloned()
    }

    /// The set of aggregate ids with at least one event, in key order.
    pub async fn aggregate_ids(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.streams.keys().cloned().collect()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Append one event as a JSON line to its stream's journal file.
fn append_journal_line(dir: &Path, event: &LearningEvent) -> Result<(), AppendError> {
    use std::io::Write;
    let path = dir
        .join("streams")
        .join(format!("{}.jsonl", stream_uuid(&event.aggregate_id)));
    let json = serde_json::to_string(event)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{json}")?;
    Ok(())
}

/// Replay one journal file into the in-memory state.
///
/// A line that fails to parse is skipped with a warning; the journal is
/// append-only, so a torn final line must not poison the whole stream.
fn replay_journal_file(path: &Path, inner: &mut StoreInner) -> Result<(), AppendError> {
    let content = std::fs::read_to_string(path)?;
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LearningEvent>(line) {
            Ok(event) => {
                if inner.seen_ids.insert(event.event_id) {
                    inner
                        .streams
                        .entry(event.aggregate_id.clone())
                        .or_default()
                        .push(event);
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping corrupt journal line"
                );
            }
        }
    }
    Ok(())
}

/// Save a snapshot atomically via the temp-rename pattern, so readers
/// never observe a partially-written file.
fn save_snapshot_file(dir: &Path, snapshot: &StateSnapshot) -> Result<(), AppendError> {
    let path = dir
        .join("snapshots")
        .join(format!("{}.json", stream_uuid(&snapshot.aggregate_id)));
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&tmp_path, &json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Load a snapshot file, treating corrupt JSON as a cache miss.
fn load_snapshot_file(path: &Path) -> Option<StateSnapshot> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read snapshot");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to deserialize snapshot; treating as cache miss"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_for(aggregate_id: &str, event_type: EventType) -> LearningEvent {
        LearningEvent::new(event_type, aggregate_id, "session-1", json!({}))
    }

    #[tokio::test]
    async fn append_then_query_returns_event_in_order() {
        let store = EventStore::new();
        let first = event_for("learner-1", EventType::LearningStarted);
        let second = event_for("learner-1", EventType::ExerciseCompleted);

        store.append(first.clone()).await.expect("append should succeed");
        store.append(second.clone()).await.expect("append should succeed");

        let events = store.query("learner-1").await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, first.event_id);
        assert_eq!(events[1].event_id, second.event_id);
    }

    #[tokio::test]
    async fn duplicate_append_is_idempotent() {
        let store = EventStore::new();
        let event = event_for("learner-1", EventType::ExerciseCompleted);

        let first = store.append(event.clone()).await.expect("append should succeed");
        let second = store.append(event.clone()).await.expect("append should succeed");

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.event_id, event.event_id);
        assert_eq!(store.query("learner-1").await.len(), 1);
    }

    #[tokio::test]
    async fn query_unknown_aggregate_returns_empty() {
        let store = EventStore::new();
        assert!(store.query("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn timestamps_are_clamped_monotonic_per_aggregate() {
        let store = EventStore::new();
        let mut first = event_for("learner-1", EventType::LearningStarted);
        first.timestamp = Utc::now();
        let mut second = event_for("learner-1", EventType::ExerciseCompleted);
        // Simulate clock skew: second event claims an earlier timestamp.
        second.timestamp = first.timestamp - chrono::Duration::seconds(30);

        store.append(first.clone()).await.expect("append should succeed");
        store.append(second).await.expect("append should succeed");

        let events = store.query("learner-1").await;
        assert_eq!(events[1].timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn query_range_filters_by_timestamp() {
        let store = EventStore::new();
        let mut early = event_for("learner-1", EventType::LearningStarted);
        early.timestamp = Utc::now() - chrono::Duration::hours(2);
        let late = event_for("learner-1", EventType::ExerciseCompleted);

        store.append(early).await.expect("append should succeed");
        store.append(late.clone()).await.expect("append should succeed");

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let events = store.query_range("learner-1", Some(cutoff), None).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, late.event_id);

        // Inverted bounds form an empty range, which is not an error.
        let inverted = store
            .query_range("learner-1", Some(Utc::now()), Some(cutoff))
            .await;
        assert!(inverted.is_empty());
    }

    #[tokio::test]
    async fn query_by_type_scans_across_aggregates() {
        let store = EventStore::new();
        store
            .append(event_for("learner-1", EventType::EmotionDetected))
            .await
            .expect("append should succeed");
        store
            .append(event_for("learner-2", EventType::EmotionDetected))
            .await
            .expect("append should succeed");
        store
            .append(event_for("learner-2", EventType::ExerciseCompleted))
            .await
            .expect("append should succeed");

        let emotions = store.query_by_type(EventType::EmotionDetected).await;
        assert_eq!(emotions.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_records_log_length_without_truncating() {
        let store = EventStore::new();
        store
            .append(event_for("learner-1", EventType::LearningStarted))
            .await
            .expect("append should succeed");
        store
            .append(event_for("learner-1", EventType::ExerciseCompleted))
            .await
            .expect("append should succeed");

        store
            .snapshot("learner-1", json!({"exercises_completed": 1}))
            .await
            .expect("snapshot should succeed");

        let snapshot = store
            .load_snapshot("learner-1")
            .await
            .expect("snapshot should exist");
        assert_eq!(snapshot.events_applied, 2);
        assert_eq!(snapshot.derived_state["exercises_completed"], 1);
        // The log is untouched.
        assert_eq!(store.query("learner-1").await.len(), 2);
    }

    #[tokio::test]
    async fn journal_replay_restores_events_and_snapshots() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");

        let event = event_for("learner-1", EventType::SkillMastered);
        {
            let store = EventStore::open(dir.path()).expect("open should succeed");
            store.append(event.clone()).await.expect("append should succeed");
            store
                .snapshot("learner-1", json!({"skills": ["fractions"]}))
                .await
                .expect("snapshot should succeed");
        }

        let reopened = EventStore::open(dir.path()).expect("reopen should succeed");
        let events = reopened.query("learner-1").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, event.event_id);

        let snapshot = reopened
            .load_snapshot("learner-1")
            .await
            .expect("snapshot should survive reopen");
        assert_eq!(snapshot.events_applied, 1);
    }

    #[tokio::test]
    async fn journal_replay_dedupes_and_skips_corrupt_lines() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let event = event_for("learner-1", EventType::InteractionRecorded);

        {
            let store = EventStore::open(dir.path()).expect("open should succeed");
            store.append(event.clone()).await.expect("append should succeed");
        }

        // Corrupt the journal with a duplicate line and a torn write.
        let path = dir
            .path()
            .join("streams")
            .join(format!("{}.jsonl", stream_uuid("learner-1")));
        let mut content = std::fs::read_to_string(&path).expect("read journal");
        let duplicate = content.lines().next().expect("one line").to_string();
        content.push_str(&duplicate);
        content.push('\n');
        content.push_str("{\"torn\":");
        std::fs::write(&path, content).expect("write journal");

        let reopened = EventStore::open(dir.path()).expect("reopen should succeed");
        assert_eq!(reopened.query("learner-1").await.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_file_uses_atomic_temp_rename() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = EventStore::open(dir.path()).expect("open should succeed");
        store
            .append(event_for("learner-1", EventType::LearningStarted))
            .await
            .expect("append should succeed");
        store
            .snapshot("learner-1", json!({}))
            .await
            .expect("snapshot should succeed");

        let final_path = dir
            .path()
            .join("snapshots")
            .join(format!("{}.json", stream_uuid("learner-1")));
        assert!(final_path.exists());
        assert!(!final_path.with_extension("json.tmp").exists());
    }

    #[test]
    fn stream_uuid_is_deterministic_and_distinct() {
        assert_eq!(stream_uuid("learner-1"), stream_uuid("learner-1"));
        assert_ne!(stream_uuid("learner-1"), stream_uuid("learner-2"));
    }
}
