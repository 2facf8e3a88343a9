//! Optimistically versioned record storage
//!
//! Every shared document (node executions, plan executions, interrupts,
//! barrier instances) goes through the same write path: read, mutate a copy,
//! replace if the version is unchanged. A stale write fails with
//! [`EngineError::VersionConflict`] and is retried by
//! [`update_with_retries`], never merged.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{EngineError, Result};

/// A document carrying an optimistic concurrency version.
pub trait Versioned: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

#[async_trait]
pub trait VersionedStore<T: Versioned>: Send + Sync {
    /// Store a new record. Fails if the id is already taken.
    async fn insert(&self, record: T) -> Result<T>;

    /// Fails with `NotFound` if absent.
    async fn get(&self, id: &str) -> Result<T>;

    /// Write `record` if its version still matches the stored one. The stored
    /// copy gets the next version and is returned.
    async fn replace(&self, record: T) -> Result<T>;
}

/// Read, mutate and replace `id`, retrying version conflicts up to
/// `max_retries` extra times. The mutator returns `false` to skip the write,
/// in which case `None` is returned.
pub async fn update_with_retries<T, S, M>(
    store: &S,
    id: &str,
    max_retries: u32,
    mut mutator: M,
) -> Result<Option<T>>
where
    T: Versioned,
    S: VersionedStore<T> + ?Sized,
    M: FnMut(&mut T) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        let mut record = store.get(id).await?;
        if !mutator(&mut record) {
            return Ok(None);
        }
        match store.replace(record).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                log::debug!(
                    "Retrying update of {} '{}' after conflict (attempt {})",
                    T::KIND,
                    id,
                    attempt
                );
            }
            Err(e) => return Err(e),
        }
    }
}

/// In-memory [`VersionedStore`] keyed by record id.
pub struct VersionedMap<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T> Default for VersionedMap<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Versioned> VersionedMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record matching `predicate`.
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.entries
            .read()
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.entries.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl<T: Versioned> VersionedStore<T> for VersionedMap<T> {
    async fn insert(&self, record: T) -> Result<T> {
        let mut entries = self.entries.write();
        if entries.contains_key(record.id()) {
            return Err(EngineError::invalid(format!(
                "{} '{}' already exists",
                T::KIND,
                record.id()
            )));
        }
        entries.insert(record.id().to_string(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<T> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(T::KIND, id))
    }

    async fn replace(&self, mut record: T) -> Result<T> {
        let mut entries = self.entries.write();
        let current = entries
            .get(record.id())
            .ok_or_else(|| EngineError::not_found(T::KIND, record.id()))?;
        if current.version() != record.version() {
            return Err(EngineError::VersionConflict {
                kind: T::KIND,
                id: record.id().to_string(),
                expected: record.version(),
                actual: current.version(),
            });
        }
        record.set_version(record.version() + 1);
        entries.insert(record.id().to_string(), record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        id: String,
        value: u32,
        version: u64,
    }

    impl Versioned for Counter {
        const KIND: &'static str = "Counter";

        fn id(&self) -> &str {
            &self.id
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    fn counter(id: &str) -> Counter {
        Counter {
            id: id.to_string(),
            value: 0,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_replace_bumps_version_and_rejects_stale() {
        let store = VersionedMap::new();
        store.insert(counter("c")).await.unwrap();

        let mut first = store.get("c").await.unwrap();
        let stale = first.clone();
        first.value = 1;
        let written = store.replace(first).await.unwrap();
        assert_eq!(written.version, 1);

        let err = store.replace(stale).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.get("c").await.unwrap().value, 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store: VersionedMap<Counter> = VersionedMap::new();
        assert!(store.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = VersionedMap::new();
        store.insert(counter("c")).await.unwrap();
        assert!(store.insert(counter("c")).await.is_err());
    }

    /// Store whose first `conflicts` replaces fail as if another writer won.
    struct Contended {
        inner: VersionedMap<Counter>,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl VersionedStore<Counter> for Contended {
        async fn insert(&self, record: Counter) -> Result<Counter> {
            self.inner.insert(record).await
        }

        async fn get(&self, id: &str) -> Result<Counter> {
            self.inner.get(id).await
        }

        async fn replace(&self, record: Counter) -> Result<Counter> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::VersionConflict {
                    kind: "Counter",
                    id: record.id.clone(),
                    expected: record.version,
                    actual: record.version + 1,
                });
            }
            self.inner.replace(record).await
        }
    }

    #[tokio::test]
    async fn test_update_retries_conflicts_then_succeeds() {
        let store = Contended {
            inner: VersionedMap::new(),
            conflicts: AtomicU32::new(2),
        };
        store.insert(counter("c")).await.unwrap();

        let updated = update_with_retries(&store, "c", 3, |c: &mut Counter| {
            c.value += 1;
            true
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.value, 1);
    }

    #[tokio::test]
    async fn test_update_surfaces_conflict_after_budget() {
        let store = Contended {
            inner: VersionedMap::new(),
            conflicts: AtomicU32::new(5),
        };
        store.insert(counter("c")).await.unwrap();

        let err = update_with_retries(&store, "c", 2, |c: &mut Counter| {
            c.value += 1;
            true
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_update_skipped_by_mutator() {
        let store = VersionedMap::new();
        store.insert(counter("c")).await.unwrap();
        let result = update_with_retries(&store, "c", 3, |_c: &mut Counter| false)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(store.get("c").await.unwrap().version, 0);
    }
}
