//! Write-temp-then-rename helpers. Readers never observe a partial file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;

/// Atomically replace `path` with `contents`.
///
/// The temp file lives in the same directory (same filesystem, so the rename
/// is atomic) and is dot-prefixed so directory scanners skip it.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = temp_path_for(path);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("replace {}", path.display()));
    }
    Ok(())
}

/// Serialize `value` as pretty JSON with a trailing newline and write atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// True for dot-prefixed names (temp files, hidden entries).
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_none_or(|name| name.starts_with('.'))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = random_suffix(8);
    path.with_file_name(format!(".{name}.{}.{suffix}.tmp", std::process::id()))
}

/// Lowercase alphanumeric suffix for collision-free file names.
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(len)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("record.json");

        write_atomic(&path, b"one").expect("first write");
        write_atomic(&path, b"two").expect("second write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| is_hidden(&entry.path()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn json_has_trailing_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("v.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "{\n  \"a\": 1\n}\n");
    }
}
