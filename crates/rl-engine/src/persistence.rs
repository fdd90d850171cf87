//! Snapshot codec and write gating for persisted learning state.
//!
//! Both engines keep their state in memory and write a full JSON snapshot
//! under a fixed store key. The gate decides when a write is due (per
//! [`PersistPolicy`]) and serializes concurrent writers so the engine's state
//! lock is held only while the snapshot is copied.

use adaptive_core::config::PersistPolicy;
use adaptive_core::{EngineError, EngineResult};
use adaptive_store::StateStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized key-value snapshot of an engine's learning state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<T> {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub entries: Vec<T>,
}

impl<T: Serialize> Snapshot<T> {
    pub fn new(entries: Vec<T>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            entries,
        }
    }

    pub fn encode(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: DeserializeOwned> Snapshot<T> {
    /// Parse a stored snapshot. Any malformed entry fails the whole decode.
    pub fn decode(raw: &str) -> EngineResult<Self> {
        let snapshot: Self = serde_json::from_str(raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(malformed(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

/// Result of reading persisted state back into an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A snapshot was found and replaced the in-memory state.
    Restored { entries: usize },
    /// Nothing stored under the key yet; in-memory state was reset.
    Empty,
    /// The store could not be read; in-memory state is unchanged.
    Unavailable,
}

/// `serialize_with` guard for snapshot floats. JSON has no encoding for
/// NaN or infinity and `serde_json` would silently write `null`.
pub(crate) fn serialize_finite<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if !value.is_finite() {
        return Err(serde::ser::Error::custom(format!(
            "cannot persist non-finite value {value}"
        )));
    }
    serializer.serialize_f64(*value)
}

/// Decode error for a snapshot that parsed but is not internally consistent.
pub(crate) fn malformed(reason: String) -> EngineError {
    EngineError::Serialization(serde::de::Error::custom(reason))
}

/// Read the raw snapshot for `key`, treating store failures as a cold start.
pub(crate) fn read_snapshot(
    store: &dyn StateStore,
    key: &str,
) -> Result<String, LoadOutcome> {
    match store.get(key) {
        Ok(Some(raw)) => Ok(raw),
        Ok(None) => {
            debug!(key = key, "No persisted snapshot, starting cold");
            metrics::counter!("engine.load.cold_start").increment(1);
            Err(LoadOutcome::Empty)
        }
        Err(e) => {
            warn!(key = key, error = %e, "Failed to read snapshot, starting cold");
            metrics::counter!("engine.load.cold_start").increment(1);
            Err(LoadOutcome::Unavailable)
        }
    }
}

/// Tracks un-flushed mutations and serializes snapshot writes.
pub struct PersistGate {
    policy: PersistPolicy,
    pending: AtomicU32,
    write_lock: Mutex<()>,
}

impl PersistGate {
    pub fn new(policy: PersistPolicy) -> EngineResult<Self> {
        if let PersistPolicy::Batched { max_pending: 0 } = policy {
            return Err(EngineError::InvalidParameter(
                "batched persistence requires max_pending >= 1".to_string(),
            ));
        }
        Ok(Self {
            policy,
            pending: AtomicU32::new(0),
            write_lock: Mutex::new(()),
        })
    }

    pub fn policy(&self) -> PersistPolicy {
        self.policy
    }

    /// Mutations applied in memory but not yet written.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Count one applied mutation. Returns true when a write is due.
    pub fn record_mutation(&self) -> bool {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        match self.policy {
            PersistPolicy::EveryUpdate => true,
            PersistPolicy::Batched { max_pending } => pending >= max_pending,
            PersistPolicy::Manual => false,
        }
    }

    /// Write the snapshot produced by `snapshot` under `key`.
    ///
    /// Writers are serialized, and each one builds its snapshot after taking
    /// the write lock, so the last write always carries every mutation that
    /// preceded it. On failure the pending count is restored.
    pub fn write<F>(&self, store: &dyn StateStore, key: &str, snapshot: F) -> EngineResult<()>
    where
        F: FnOnce() -> EngineResult<String>,
    {
        let _guard = self.write_lock.lock();
        let claimed = self.pending.swap(0, Ordering::SeqCst);

        let result = snapshot().and_then(|payload| store.set(key, &payload));
        match &result {
            Ok(()) => {
                metrics::counter!("engine.persist.ok").increment(1);
                debug!(key = key, flushed = claimed, "Snapshot persisted");
            }
            Err(e) => {
                self.pending.fetch_add(claimed, Ordering::SeqCst);
                metrics::counter!("engine.persist.error").increment(1);
                warn!(key = key, error = %e, pending = self.pending(), "Snapshot persist failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptive_store::MemoryStore;

    struct BrokenStore;

    impl StateStore for BrokenStore {
        fn get(&self, _key: &str) -> EngineResult<Option<String>> {
            Err(EngineError::Store("connection refused".to_string()))
        }

        fn set(&self, _key: &str, _value: &str) -> EngineResult<()> {
            Err(EngineError::Store("connection refused".to_string()))
        }
    }

    #[test]
    fn test_snapshot_decode_rejects_unknown_version() {
        let raw = r#"{"version": 9, "saved_at": "2024-01-01T00:00:00Z", "entries": []}"#;
        let err = Snapshot::<(String, f64)>::decode(raw).unwrap_err();
        assert!(matches!(err, EngineError::Serialization(_)));
    }

    #[test]
    fn test_snapshot_decode_rejects_garbage() {
        assert!(Snapshot::<(String, f64)>::decode("{not json").is_err());
        let truncated = r#"{"version": 1, "saved_at": "2024-01-01T00:00:00Z", "entries": [["a"]]}"#;
        assert!(Snapshot::<(String, f64)>::decode(truncated).is_err());
    }

    #[test]
    fn test_batched_gate_flushes_at_threshold() {
        let gate = PersistGate::new(PersistPolicy::Batched { max_pending: 3 }).unwrap();
        assert!(!gate.record_mutation());
        assert!(!gate.record_mutation());
        assert!(gate.record_mutation());

        let store = MemoryStore::new();
        gate.write(&store, "k", || Ok("{}".to_string())).unwrap();
        assert_eq!(gate.pending(), 0);
        assert_eq!(store.get("k").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_manual_gate_never_requests_write() {
        let gate = PersistGate::new(PersistPolicy::Manual).unwrap();
        for _ in 0..10 {
            assert!(!gate.record_mutation());
        }
        assert_eq!(gate.pending(), 10);
    }

    #[test]
    fn test_zero_batch_is_rejected() {
        assert!(PersistGate::new(PersistPolicy::Batched { max_pending: 0 }).is_err());
    }

    #[test]
    fn test_failed_write_keeps_pending_count() {
        let gate = PersistGate::new(PersistPolicy::EveryUpdate).unwrap();
        gate.record_mutation();
        gate.record_mutation();

        let err = gate.write(&BrokenStore, "k", || Ok("{}".to_string()));
        assert!(matches!(err, Err(EngineError::Store(_))));
        assert_eq!(gate.pending(), 2);
    }

    #[test]
    fn test_read_snapshot_classifies_missing_and_broken() {
        let store = MemoryStore::new();
        assert_eq!(read_snapshot(&store, "k"), Err(LoadOutcome::Empty));
        assert_eq!(read_snapshot(&BrokenStore, "k"), Err(LoadOutcome::Unavailable));

        store.set("k", "payload").unwrap();
        assert_eq!(read_snapshot(&store, "k"), Ok("payload".to_string()));
    }
}
