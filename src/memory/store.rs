//! Thread memory store and persistence backends

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use super::{RunSummary, ThreadMemory};
use crate::error::MemoryError;

/// Memory window configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Conversation turns kept per thread
    pub history_window: usize,
    /// Report snapshots kept per thread
    pub report_window: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            history_window: 12,
            report_window: 12,
        }
    }
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window.max(1);
        self
    }

    pub fn with_report_window(mut self, window: usize) -> Self {
        self.report_window = window.max(1);
        self
    }
}

/// Persistence capability for thread memory.
///
/// Swap in a durable store without touching the engine.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<ThreadMemory>, MemoryError>;

    async fn save(&self, memory: &ThreadMemory) -> Result<(), MemoryError>;
}

/// Process-lifetime backend
///
/// **Note:** uses `tokio::sync::RwLock` so reads never block the runtime
#[derive(Default)]
pub struct InMemoryBackend {
    threads: RwLock<HashMap<String, ThreadMemory>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn load(&self, thread_id: &str) -> Result<Option<ThreadMemory>, MemoryError> {
        Ok(self.threads.read().await.get(thread_id).cloned())
    }

    async fn save(&self, memory: &ThreadMemory) -> Result<(), MemoryError> {
        self.threads
            .write()
            .await
            .insert(memory.thread_id.clone(), memory.clone());
        Ok(())
    }
}

/// Thread memory store with per-thread serialization.
///
/// A [`ThreadCheckout`] holds the thread's lock from load until save, so a
/// second run on the same thread waits until the first one has folded its
/// summary in. Different threads never contend. A thread's lock entry
/// lives only while a checkout holds it or waits for it.
#[derive(Clone)]
pub struct ThreadMemoryStore {
    backend: Arc<dyn MemoryBackend>,
    config: MemoryConfig,
    locks: ThreadLocks,
}

type ThreadLocks = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

impl ThreadMemoryStore {
    pub fn new(backend: Arc<dyn MemoryBackend>, config: MemoryConfig) -> Self {
        Self {
            backend,
            config,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Store over a fresh [`InMemoryBackend`]
    pub fn in_memory(config: MemoryConfig) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), config)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(thread_id.to_string()).or_default().clone()
    }

    /// Threads that currently have a lock entry.
    #[cfg(test)]
    fn tracked_threads(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn load_or_new(&self, thread_id: &str) -> Result<ThreadMemory, MemoryError> {
        Ok(self
            .backend
            .load(thread_id)
            .await?
            .unwrap_or_else(|| ThreadMemory::new(thread_id)))
    }

    /// Lock the thread and load its memory (empty if absent).
    pub async fn checkout(&self, thread_id: &str) -> Result<ThreadCheckout, MemoryError> {
        let mut lease = ThreadLease {
            locks: self.locks.clone(),
            thread_id: thread_id.to_string(),
            lock: self.thread_lock(thread_id),
            guard: None,
        };
        lease.guard = Some(lease.lock.clone().lock_owned().await);
        let memory = self.load_or_new(thread_id).await?;
        debug!(thread_id, runs = memory.run_count, "Thread memory checked out");
        Ok(ThreadCheckout {
            store: self.clone(),
            memory,
            _lease: lease,
        })
    }

    /// Snapshot of a thread's memory, waiting for any in-flight run.
    pub async fn load(&self, thread_id: &str) -> Result<ThreadMemory, MemoryError> {
        let checkout = self.checkout(thread_id).await?;
        Ok(checkout.memory)
    }

    /// Fold a summary into a thread outside of a run.
    pub async fn save(&self, thread_id: &str, summary: RunSummary) -> Result<ThreadMemory, MemoryError> {
        self.checkout(thread_id).await?.save(summary).await
    }
}

/// A locked thread: the loaded memory plus the guard that serializes runs.
pub struct ThreadCheckout {
    store: ThreadMemoryStore,
    memory: ThreadMemory,
    _lease: ThreadLease,
}

/// Holds (or waits for) a thread's lock and drops the lock entry once the
/// last holder is gone.
struct ThreadLease {
    locks: ThreadLocks,
    thread_id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadLease {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // map entry plus our own handle means nobody else holds or waits
        let idle = locks
            .get(&self.thread_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2);
        if idle {
            locks.remove(&self.thread_id);
        }
    }
}

impl ThreadCheckout {
    pub fn memory(&self) -> &ThreadMemory {
        &self.memory
    }

    pub fn thread_id(&self) -> &str {
        &self.memory.thread_id
    }

    /// Apply the summary, persist, and release the thread.
    pub async fn save(mut self, summary: RunSummary) -> Result<ThreadMemory, MemoryError> {
        self.memory.apply(summary, &self.store.config, Utc::now());
        self.store.backend.save(&self.memory).await?;
        debug!(
            thread_id = %self.memory.thread_id,
            history = self.memory.history.len(),
            reports = self.memory.report_memories.len(),
            "Thread memory saved"
        );
        Ok(self.memory)
    }
}
