use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use snafu::{ResultExt, ensure};

use super::error::{
    CreateDirectorySnafu, InvariantViolationSnafu, ReadFileSnafu, RemoveFileSnafu,
    RenameFileSnafu, StorageResult, WriteFileSnafu,
};

/// Local key/value persistence. Every `write` replaces the whole value in one step,
/// so a reader never observes a partially written value.
pub trait KeyValueBackend: Send + Sync {
    fn read(&self, key: &str) -> StorageResult<Option<String>>;
    fn write(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, op: impl FnOnce(&mut HashMap<String, String>) -> T) -> T {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        op(&mut entries)
    }
}

impl KeyValueBackend for MemoryBackend {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.with_entries(|entries| entries.get(key).cloned()))
    }

    fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        self.with_entries(|entries| entries.insert(key.to_string(), value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.with_entries(|entries| entries.remove(key));
        Ok(())
    }
}

/// One JSON file per key inside `root`.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str, stage: &'static str) -> StorageResult<PathBuf> {
        ensure!(
            !key.is_empty()
                && key
                    .chars()
                    .all(|character| character.is_ascii_alphanumeric() || "._-".contains(character)),
            InvariantViolationSnafu {
                stage,
                details: format!("key '{key}' cannot be mapped to a file name"),
            }
        );
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl KeyValueBackend for FileBackend {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.path_for(key, "file-backend-read")?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(source).context(ReadFileSnafu {
                stage: "file-backend-read",
                path: path.display().to_string(),
            }),
        }
    }

    fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.path_for(key, "file-backend-write")?;
        std::fs::create_dir_all(&self.root).context(CreateDirectorySnafu {
            stage: "file-backend-create-root",
            path: self.root.display().to_string(),
        })?;

        // Write then rename so the previous value stays intact until the new one is complete.
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, value).context(WriteFileSnafu {
            stage: "file-backend-write-temporary",
            path: temp_path.display().to_string(),
        })?;
        std::fs::rename(&temp_path, &path).context(RenameFileSnafu {
            stage: "file-backend-rename-temporary",
            from: temp_path.display().to_string(),
            to: path.display().to_string(),
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key, "file-backend-remove")?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(RemoveFileSnafu {
                stage: "file-backend-remove",
                path: path.display().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn file_backend_replaces_and_removes_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FileBackend::new(dir.path().join("nested"));

        assert_eq!(backend.read("hearth.history").expect("read"), None);

        backend.write("hearth.history", "{\"a\":1}").expect("write");
        backend.write("hearth.history", "{}").expect("overwrite");
        assert_eq!(
            backend.read("hearth.history").expect("read").as_deref(),
            Some("{}")
        );
        assert!(!dir.path().join("nested/hearth.history.json.tmp").exists());

        backend.remove("hearth.history").expect("remove");
        backend.remove("hearth.history").expect("second remove is a no-op");
        assert_eq!(backend.read("hearth.history").expect("read"), None);
    }

    #[test]
    fn file_backend_rejects_path_like_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FileBackend::new(dir.path());

        let error = backend.write("../escape", "x").unwrap_err();
        assert!(matches!(error, StorageError::InvariantViolation { .. }));
    }

    #[test]
    fn memory_backend_round_trips() {
        let backend = MemoryBackend::new();
        backend.write("k", "v").expect("write");
        assert_eq!(backend.read("k").expect("read").as_deref(), Some("v"));
        backend.remove("k").expect("remove");
        assert_eq!(backend.read("k").expect("read"), None);
    }
}
