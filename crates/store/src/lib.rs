//! Key-value store abstraction behind the session and execution records.
//!
//! The core never talks to a concrete datastore: everything goes through
//! [`Store`], so the same components run against the in-process
//! [`MemStore`] in tests and a real backend in production.  Updates are
//! versioned compare-and-swap — the caller supplies the version it read
//! and loses with [`StoreError::VersionConflict`] when a concurrent writer
//! got there first.  Retrying that loop is what makes "check budget, then
//! debit" a single atomic unit per record.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use hireling_types::Versioned;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    AlreadyExists(Uuid),
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict { id: Uuid, expected: u64, actual: u64 },
}

#[async_trait]
pub trait Store<T>: Send + Sync
where
    T: Versioned + Clone + Send + Sync + 'static,
{
    /// Insert a new record.  Fails with `AlreadyExists` when the id is
    /// taken — this is the uniqueness guard settlement creation relies on.
    async fn create(&self, id: Uuid, value: T) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<T>, StoreError>;

    /// Replace the record iff its stored version still equals
    /// `expected_version`.  On success the stored copy carries
    /// `expected_version + 1` and is returned.
    async fn update(&self, id: Uuid, expected_version: u64, value: T) -> Result<T, StoreError>;

    /// Remove a record.  Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<T>, StoreError>;
}

/// Read-modify-write with CAS retry.
///
/// `mutate` inspects and edits a copy of the record and may reject with a
/// typed domain error (budget exhausted, illegal state, ...); rejection
/// aborts without retrying.  A `VersionConflict` from the store re-reads
/// and re-applies, so the closure must be safe to run more than once.
pub async fn modify<T, E, F>(store: &dyn Store<T>, id: Uuid, mut mutate: F) -> Result<T, E>
where
    T: Versioned + Clone + Send + Sync + 'static,
    E: From<StoreError>,
    F: FnMut(&mut T) -> Result<(), E>,
{
    loop {
        let current = store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id))?;
        let read_version = current.version();
        let mut next = current;
        mutate(&mut next)?;
        match store.update(id, read_version, next).await {
            Ok(stored) => return Ok(stored),
            Err(StoreError::VersionConflict { .. }) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// In-process store over a `RwLock<HashMap>`.  The default substrate for
/// tests and the single-node daemon.
pub struct MemStore<T> {
    records: RwLock<HashMap<Uuid, T>>,
}

impl<T> MemStore<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for MemStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Store<T> for MemStore<T>
where
    T: Versioned + Clone + Send + Sync + 'static,
{
    async fn create(&self, id: Uuid, value: T) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("store lock poisoned");
        if records.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        records.insert(id, value);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<T>, StoreError> {
        let records = self.records.read().expect("store lock poisoned");
        Ok(records.get(&id).cloned())
    }

    async fn update(&self, id: Uuid, expected_version: u64, mut value: T) -> Result<T, StoreError> {
        let mut records = self.records.write().expect("store lock poisoned");
        let current = records.get(&id).ok_or(StoreError::NotFound(id))?;
        let actual = current.version();
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual,
            });
        }
        value.set_version(expected_version + 1);
        records.insert(id, value.clone());
        Ok(value)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut records = self.records.write().expect("store lock poisoned");
        Ok(records.remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<T>, StoreError> {
        let records = self.records.read().expect("store lock poisoned");
        Ok(records.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        value: u64,
        version: u64,
    }

    impl Versioned for Counter {
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    fn counter(value: u64) -> Counter {
        Counter { value, version: 0 }
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = MemStore::new();
        let id = Uuid::new_v4();
        store.create(id, counter(7)).await.unwrap();
        let got = store.get(id).await.unwrap().unwrap();
        assert_eq!(got.value, 7);
    }

    #[tokio::test]
    async fn create_duplicate_fails() {
        let store = MemStore::new();
        let id = Uuid::new_v4();
        store.create(id, counter(1)).await.unwrap();
        let err = store.create(id, counter(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(conflict) if conflict == id));
        // First write untouched.
        assert_eq!(store.get(id).await.unwrap().unwrap().value, 1);
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let store = MemStore::new();
        let id = Uuid::new_v4();
        store.create(id, counter(1)).await.unwrap();

        let stored = store.update(id, 0, counter(2)).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.value, 2);

        let stored = store.update(id, 1, counter(3)).await.unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = MemStore::new();
        let id = Uuid::new_v4();
        store.create(id, counter(1)).await.unwrap();
        store.update(id, 0, counter(2)).await.unwrap();

        let err = store.update(id, 0, counter(9)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 0, actual: 1, .. }
        ));
        // Losing write left no trace.
        assert_eq!(store.get(id).await.unwrap().unwrap().value, 2);
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let store: MemStore<Counter> = MemStore::new();
        let err = store.update(Uuid::new_v4(), 0, counter(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent_about_absence() {
        let store = MemStore::new();
        let id = Uuid::new_v4();
        store.create(id, counter(1)).await.unwrap();
        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn modify_retries_past_conflicts() {
        use std::sync::Arc;

        let store = Arc::new(MemStore::new());
        let id = Uuid::new_v4();
        store.create(id, counter(0)).await.unwrap();

        // 20 concurrent increments through the CAS loop: none may be lost.
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                modify::<_, StoreError, _>(store.as_ref(), id, |c| {
                    c.value += 1;
                    Ok(())
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get(id).await.unwrap().unwrap().value, 20);
    }

    #[tokio::test]
    async fn modify_propagates_rejection_without_writing() {
        let store = MemStore::new();
        let id = Uuid::new_v4();
        store.create(id, counter(5)).await.unwrap();

        #[derive(Debug, thiserror::Error)]
        enum TestError {
            #[error("rejected")]
            Rejected,
            #[error(transparent)]
            Store(#[from] StoreError),
        }

        let err = modify::<_, TestError, _>(&store, id, |c| {
            c.value = 99;
            Err(TestError::Rejected)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TestError::Rejected));
        assert_eq!(store.get(id).await.unwrap().unwrap().value, 5);
    }
}
