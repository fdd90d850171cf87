#![warn(clippy::unwrap_used)]

//! Key-value boundary for persisted learning state.

pub mod client;
pub mod local;

pub use client::RedisStore;
pub use local::MemoryStore;

use adaptive_core::config::{StoreBackend, StoreConfig};
use adaptive_core::EngineResult;
use std::sync::Arc;

/// A string-keyed blob store. Implementations must be safe to share across threads.
pub trait StateStore: Send + Sync {
    /// Read the blob stored under `key`, `None` if the key was never written.
    fn get(&self, key: &str) -> EngineResult<Option<String>>;

    /// Overwrite the blob stored under `key`.
    fn set(&self, key: &str, value: &str) -> EngineResult<()>;
}

impl<S: StateStore + ?Sized> StateStore for Arc<S> {
    fn get(&self, key: &str) -> EngineResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        (**self).set(key, value)
    }
}

/// Open the backend selected in `config`.
pub fn open_store(config: &StoreConfig) -> EngineResult<Arc<dyn StateStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(config)?)),
    }
}
