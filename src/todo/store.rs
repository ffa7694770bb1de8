//! Todo storage.
//!
//! # Responsibilities
//! - Define the storage contract the command handlers are written against
//! - Provide a concurrent in-memory store with optional JSON snapshots
//!
//! # Design Decisions
//! - The store is injected into handlers as `Arc<dyn TodoStore>`
//! - Snapshots are rewritten after every mutation through a temp file and
//!   rename, so a crash never leaves a half-written file
//! - A mutation whose snapshot write fails is rolled back in memory
//! - File I/O runs on the blocking pool; an async mutex orders the writes

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use crate::todo::model::Todo;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("todo `{0}` already exists")]
    Conflict(String),

    #[error("snapshot `{path}` could not be accessed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot `{path}` is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Keyed storage for todo items.
#[async_trait]
pub trait TodoStore: Send + Sync {
    async fn find_all(&self) -> Result<Vec<Todo>, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Todo>, StoreError>;

    /// Store a new item. Fails with `Conflict` if the id is taken.
    async fn insert(&self, todo: Todo) -> Result<(), StoreError>;

    /// Overwrite an existing item. Returns `false` if there was none.
    async fn replace(&self, todo: Todo) -> Result<bool, StoreError>;

    /// Remove an item. Returns `false` if there was none.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

/// In-memory store backed by a `DashMap`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: DashMap<String, Todo>,
    snapshot: Option<PathBuf>,
    /// Serializes mutate-then-snapshot sequences.
    writes: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let items = DashMap::new();

        if path.exists() {
            let file = File::open(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let todos: Vec<Todo> = serde_json::from_reader(BufReader::new(file)).map_err(
                |source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                },
            )?;
            for todo in todos {
                items.insert(todo.id.clone(), todo);
            }
            tracing::info!(path = %path.display(), items = items.len(), "Loaded todo snapshot");
        }

        Ok(Self {
            items,
            snapshot: Some(path),
            writes: Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    async fn lock(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().await
    }

    fn sorted(&self) -> Vec<Todo> {
        let mut todos: Vec<Todo> = self.items.iter().map(|r| r.value().clone()).collect();
        todos.sort_by(|a, b| a.id.cmp(&b.id));
        todos
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = self.snapshot.clone() else {
            return Ok(());
        };
        let todos = self.sorted();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&target, &todos))
            .await
            .map_err(|err| StoreError::Io {
                path,
                source: std::io::Error::other(err),
            })?
    }
}

fn write_snapshot(path: &Path, todos: &[Todo]) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let tmp = path.with_extension("tmp");

    let file = File::create(&tmp).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, todos).map_err(|err| io_error(err.into()))?;
    writer.flush().map_err(io_error)?;
    fs::rename(&tmp, path).map_err(io_error)?;

    tracing::debug!(path = %path.display(), items = todos.len(), "Saved todo snapshot");
    Ok(())
}

#[async_trait]
impl TodoStore for MemoryStore {
    async fn find_all(&self) -> Result<Vec<Todo>, StoreError> {
        Ok(self.sorted())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Todo>, StoreError> {
        Ok(self.items.get(id).map(|r| r.value().clone()))
    }

    async fn insert(&self, todo: Todo) -> Result<(), StoreError> {
        let _guard = self.lock().await;
        let id = todo.id.clone();
        match self.items.entry(id.clone()) {
            Entry::Occupied(_) => return Err(StoreError::Conflict(id)),
            Entry::Vacant(slot) => {
                slot.insert(todo);
            }
        }

        if let Err(err) = self.persist().await {
            self.items.remove(&id);
            return Err(err);
        }
        Ok(())
    }

    async fn replace(&self, todo: Todo) -> Result<bool, StoreError> {
        let _guard = self.lock().await;
        let id = todo.id.clone();
        let previous = match self.items.get_mut(&id) {
            Some(mut existing) => std::mem::replace(existing.value_mut(), todo),
            None => return Ok(false),
        };

        if let Err(err) = self.persist().await {
            self.items.insert(id, previous);
            return Err(err);
        }
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock().await;
        let Some((key, removed)) = self.items.remove(id) else {
            return Ok(false);
        };

        if let Err(err) = self.persist().await {
            self.items.insert(key, removed);
            return Err(err);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn todo(id: &str, text: &str) -> Todo {
        Todo {
            id: id.into(),
            text: text.into(),
            done: false,
        }
    }

    #[tokio::test]
    async fn test_crud_cycle() {
        let store = MemoryStore::new();
        store.insert(todo("b", "bread")).await.unwrap();
        store.insert(todo("a", "apples")).await.unwrap();

        let all = store.find_all().await.unwrap();
        assert_eq!(all.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let mut bread = store.find_by_id("b").await.unwrap().unwrap();
        bread.done = true;
        assert!(store.replace(bread).await.unwrap());
        assert!(store.find_by_id("b").await.unwrap().unwrap().done);

        assert!(store.delete("b").await.unwrap());
        assert!(!store.delete("b").await.unwrap());
        assert!(!store.replace(todo("b", "gone")).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let store = MemoryStore::new();
        store.insert(todo("x", "one")).await.unwrap();
        let err = store.insert(todo("x", "two")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(id) if id == "x"));
        assert_eq!(store.find_by_id("x").await.unwrap().unwrap().text, "one");
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let path = std::env::temp_dir().join(format!("todo-store-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);

        let store = MemoryStore::open(&path).unwrap();
        store.insert(todo("k", "kept")).await.unwrap();
        store.insert(todo("d", "dropped")).await.unwrap();
        store.delete("d").await.unwrap();
        drop(store);

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.find_by_id("k").await.unwrap().unwrap().text, "kept");

        fs::remove_file(&path).unwrap_or_default();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_all_reach_the_snapshot() {
        let path = std::env::temp_dir().join(format!("todo-concurrent-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);

        let store = std::sync::Arc::new(MemoryStore::open(&path).unwrap());
        assert!(store.is_empty());
        let writers: Vec<_> = (0..32)
            .map(|n| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move { store.insert(todo(&format!("t{n:02}"), "item")).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        drop(store);

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 32);
        assert!(!path.with_extension("tmp").exists());

        fs::remove_file(&path).unwrap_or_default();
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let path = std::env::temp_dir().join(format!("todo-corrupt-{}.json", std::process::id()));
        fs::write(&path, b"{ not a list").unwrap();
        assert!(matches!(MemoryStore::open(&path), Err(StoreError::Corrupt { .. })));
        fs::remove_file(&path).unwrap_or_default();
    }
}
