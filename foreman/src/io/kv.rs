//! Small key-value seam over the shared filesystem.
//!
//! Callers speak `get/put/list/delete`; [`FsStore`] keeps one JSON file per
//! key. Any backing store with an atomic `put` can stand in.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::ids::validate_id;
use crate::io::atomic::write_atomic;

/// Key-value storage with atomic single-key writes and no cross-key
/// transactions.
pub trait KvStore {
    /// Raw value for `key`, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Atomically replace the value for `key`.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// All keys present at call time, sorted.
    fn list(&self) -> Result<Vec<String>>;
    /// Remove `key`. Returns `false` if it was already absent.
    fn delete(&self, key: &str) -> Result<bool>;
}

/// Directory-backed store: key `k` lives at `<root>/k.json`.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl KvStore for FsStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_id(key)?;
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_id(key)?;
        let path = self.path_for(key);
        debug!(path = %path.display(), bytes = value.len(), "kv put");
        write_atomic(&path, value)
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.root.display()));
            }
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.context("read entry")?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        validate_id(key)?;
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_list_delete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path().join("kv"));

        assert!(store.list().expect("list empty").is_empty());
        assert_eq!(store.get("a").expect("get missing"), None);

        store.put("b", b"2").expect("put b");
        store.put("a", b"1").expect("put a");
        assert_eq!(store.list().expect("list"), vec!["a", "b"]);
        assert_eq!(store.get("a").expect("get"), Some(b"1".to_vec()));

        assert!(store.delete("a").expect("delete"));
        assert!(!store.delete("a").expect("delete again"));
        assert_eq!(store.list().expect("list"), vec!["b"]);
    }

    #[test]
    fn rejects_path_like_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        assert!(store.put("../escape", b"x").is_err());
    }

    #[test]
    fn list_ignores_temp_and_foreign_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(temp.path());
        fs::write(temp.path().join(".x.json.1.abc.tmp"), "{}").expect("tmp");
        fs::write(temp.path().join("notes.txt"), "hi").expect("txt");
        store.put("task-1", b"{}").expect("put");
        assert_eq!(store.list().expect("list"), vec!["task-1"]);
    }
}
