use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::PersistenceError;

/// A row type stored in a [`Table`].
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: Ord + Clone + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

type Rows<R> = BTreeMap<<R as Record>::Key, R>;

/// Keyed collection of records with snapshot reads and serialised writes.
///
/// Readers load the current snapshot without locking and never see a write in progress.
/// Each write copies the snapshot, applies the mutation, saves the result to disk (when the
/// table is file-backed) and only then publishes the new snapshot. Writes run on the
/// blocking pool, so a caller that stops waiting cannot interrupt one halfway.
pub struct Table<R: Record> {
    inner: Arc<Inner<R>>,
}

struct Inner<R: Record> {
    rows: ArcSwap<Rows<R>>,
    path: Option<PathBuf>,
    writer: Mutex<()>,
}

impl<R: Record> Clone for Table<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Record> Table<R> {
    /// A table that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::from_rows(Rows::<R>::new(), None)
    }

    /// Open a table stored as a JSON array at `path`, creating it on first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let rows = match fs::read_to_string(&path) {
            Ok(text) => {
                let records: Vec<R> =
                    serde_json::from_str(&text).map_err(|source| PersistenceError::Decode {
                        path: path.clone(),
                        source,
                    })?;
                records.into_iter().map(|r| (r.key(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Rows::<R>::new(),
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        debug!("Loaded {} record(s) from {}", rows.len(), path.display());
        Ok(Self::from_rows(rows, Some(path)))
    }

    fn from_rows(rows: Rows<R>, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                rows: ArcSwap::from_pointee(rows),
                path,
                writer: Mutex::new(()),
            }),
        }
    }

    /// The current contents. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<Rows<R>> {
        self.inner.rows.load_full()
    }

    pub fn get(&self, key: &R::Key) -> Option<R> {
        self.inner.rows.load().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.rows.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `mutate` as one atomic write and return what it returned.
    ///
    /// If saving fails the snapshot is left untouched.
    pub async fn commit<T, F>(&self, mutate: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&mut Rows<R>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.commit(mutate))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))?
    }
}

impl<R: Record> Inner<R> {
    fn commit<T>(&self, mutate: impl FnOnce(&mut Rows<R>) -> T) -> Result<T, PersistenceError> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let mut next = Rows::<R>::clone(&self.rows.load());
        let out = mutate(&mut next);
        if let Some(path) = &self.path {
            save(path, &next)?;
        }
        self.rows.store(Arc::new(next));
        Ok(out)
    }
}

/// Write the rows to a sibling temp file, then rename it over `path`.
fn save<R: Record>(path: &Path, rows: &Rows<R>) -> Result<(), PersistenceError> {
    let io_error = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let records: Vec<&R> = rows.values().collect();
    let json = serde_json::to_vec_pretty(&records).map_err(|source| PersistenceError::Encode {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp).map_err(io_error)?;
    file.write_all(&json).map_err(io_error)?;
    file.sync_all().map_err(io_error)?;
    fs::rename(&tmp, path).map_err(io_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u32,
        value: String,
    }

    impl Record for Row {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }
    }

    fn row(id: u32, value: &str) -> Row {
        Row {
            id,
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_new_snapshot() {
        let table = Table::<Row>::in_memory();
        let before = table.snapshot();

        let inserted = table
            .commit(|rows| rows.insert(1, row(1, "a")).is_none())
            .await
            .unwrap();

        assert!(inserted);
        assert!(before.is_empty());
        assert_eq!(table.get(&1), Some(row(1, "a")));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_table_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rows.json");

        let table = Table::<Row>::open(&path).unwrap();
        assert!(table.is_empty());
        table
            .commit(|rows| {
                rows.insert(2, row(2, "b"));
                rows.insert(1, row(1, "a"));
            })
            .await
            .unwrap();

        let reopened = Table::<Row>::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(&2), Some(row(2, "b")));
        assert!(!path.with_file_name("rows.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.json");
        fs::write(&path, "{ not json").unwrap();

        let err = Table::<Row>::open(&path).err().unwrap();
        assert!(matches!(err, PersistenceError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_old_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("rows.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "x").unwrap();

        let table = Table::<Row>::from_rows(Rows::<Row>::new(), Some(path));
        let result = table.commit(|rows| rows.insert(1, row(1, "a"))).await;

        assert!(matches!(result, Err(PersistenceError::Io { .. })));
        assert!(table.is_empty());
    }
}
