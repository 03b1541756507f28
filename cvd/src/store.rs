//! A single persisted value behind a reader/writer lock.
//!
//! `GuardedStore` is the only code that touches the backing file. Shared
//! access runs concurrently with other shared access; exclusive access runs
//! alone, works on a copy of the state, and writes the copy back (temp file +
//! rename) before publishing it when, and only when, the unit of work
//! succeeded and actually changed something.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing state file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("serializing state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("writing state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub struct GuardedStore<S> {
    path: PathBuf,
    state: RwLock<S>,
}

impl<S> GuardedStore<S>
where
    S: Clone + PartialEq + Default + Serialize + DeserializeOwned + Send + Sync,
{
    /// Open the store, loading the backing file when it exists. A missing
    /// file yields the default state and is not created until the first
    /// mutation.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
        let state = if exists {
            let data = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| StoreError::Read {
                    path: path.clone(),
                    source,
                })?;
            if data.trim().is_empty() {
                S::default()
            } else {
                serde_json::from_str(&data).map_err(|source| StoreError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
        } else {
            info!(path = %path.display(), "no persisted state file, starting fresh");
            S::default()
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with read access. Any number of shared calls may overlap.
    pub async fn with_shared<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let guard = self.state.read().await;
        f(&guard)
    }

    /// Run `f` with exclusive access.
    ///
    /// `f` mutates a working copy. If it returns `Err`, the copy is dropped
    /// and neither memory nor disk change. If it returns `Ok` and the copy
    /// differs from the current state, the copy is persisted first and only
    /// then becomes the current state; a persistence failure is returned and
    /// the in-memory state stays as it was.
    pub async fn with_exclusive<R, E>(&self, f: impl FnOnce(&mut S) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut guard = self.state.write().await;
        let mut working = guard.clone();
        let result = f(&mut working)?;

        if working != *guard {
            self.persist(&working).await?;
            *guard = working;
        }

        Ok(result)
    }

    async fn persist(&self, state: &S) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(dir = %parent.display(), error = %e, "failed to create state directory");
            }
        }

        let data = serde_json::to_string_pretty(state)?;

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(|source| StoreError::Write {
                path: tmp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })?;

        // Restrict permissions to owner-only
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = tokio::fs::set_permissions(&self.path, perms).await {
            warn!(path = %self.path.display(), error = %e, "failed to restrict state file permissions");
        }

        debug!(path = %self.path.display(), bytes = data.len(), "state persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Counter {
        value: u32,
        names: Vec<String>,
    }

    #[derive(Debug)]
    enum TestError {
        Rejected,
        Store(StoreError),
    }

    impl From<StoreError> for TestError {
        fn from(e: StoreError) -> Self {
            TestError::Store(e)
        }
    }

    #[tokio::test]
    async fn test_open_missing_file_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store: GuardedStore<Counter> = GuardedStore::open(&path).await.unwrap();
        assert_eq!(store.with_shared(|s| s.clone()).await, Counter::default());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_open_unreadable_location_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("plain-file");
        std::fs::write(&not_a_dir, "x").unwrap();

        let result: Result<GuardedStore<Counter>, _> =
            GuardedStore::open(not_a_dir.join("state.json")).await;
        assert!(matches!(result, Err(StoreError::Read { .. })));
    }

    #[tokio::test]
    async fn test_mutation_is_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store: GuardedStore<Counter> = GuardedStore::open(&path).await.unwrap();
        store
            .with_exclusive(|s| {
                s.value = 7;
                s.names.push("a".into());
                Ok::<_, TestError>(())
            })
            .await
            .unwrap();
        assert!(path.exists());

        let reopened: GuardedStore<Counter> = GuardedStore::open(&path).await.unwrap();
        let state = reopened.with_shared(|s| s.clone()).await;
        assert_eq!(state.value, 7);
        assert_eq!(state.names, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_work_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store: GuardedStore<Counter> = GuardedStore::open(&path).await.unwrap();
        store
            .with_exclusive(|s| {
                s.value = 1;
                Ok::<_, TestError>(())
            })
            .await
            .unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let result = store
            .with_exclusive(|s| {
                s.value = 99;
                Err::<(), _>(TestError::Rejected)
            })
            .await;
        assert!(matches!(result, Err(TestError::Rejected)));

        assert_eq!(store.with_shared(|s| s.value).await, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store: GuardedStore<Counter> = GuardedStore::open(&path).await.unwrap();
        let value = store
            .with_exclusive(|s| Ok::<_, TestError>(s.value))
            .await
            .unwrap();
        assert_eq!(value, 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result: Result<GuardedStore<Counter>, _> = GuardedStore::open(&path).await;
        assert!(matches!(result, Err(StoreError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_unwritable_path_keeps_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("state.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), "x").unwrap();

        let store: GuardedStore<Counter> = GuardedStore {
            path: path.clone(),
            state: RwLock::new(Counter::default()),
        };
        let result = store
            .with_exclusive(|s| {
                s.value = 5;
                Ok::<_, TestError>(())
            })
            .await;
        assert!(matches!(result, Err(TestError::Store(StoreError::Write { .. }))));
        assert_eq!(store.with_shared(|s| s.value).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_updates_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store: Arc<GuardedStore<Counter>> =
            Arc::new(GuardedStore::open(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .with_exclusive(|s| {
                        s.value += 1;
                        s.names.push(format!("w{}", i));
                        Ok::<_, TestError>(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let state = store.with_shared(|s| s.clone()).await;
        assert_eq!(state.value, 16);
        assert_eq!(state.names.len(), 16);

        let reopened: GuardedStore<Counter> = GuardedStore::open(&path).await.unwrap();
        assert_eq!(reopened.with_shared(|s| s.value).await, 16);
    }
}
