//! Hierarchical record storage addressed by id paths.
//!
//! The tree only needs three primitives: write a record at a path, read it back, and list the
//! child directories of a path. [`FileStore`] maps them onto JSON files below a save
//! directory, one directory level per path segment.

use std::path::{Path as FsPath, PathBuf};

use serde_json::Value;

use crate::error::{Error, Result};

/// Storage substrate for conversation and message records.
pub trait RecordStore: Send + Sync {
    /// Write `record` as `name` inside the directory addressed by `dir`.
    fn write(&self, dir: &[String], name: &str, record: &Value) -> Result<()>;

    /// Read record `name` inside `dir`. `Ok(None)` if it does not exist.
    fn read(&self, dir: &[String], name: &str) -> Result<Option<Value>>;

    /// Names of the child directories of `dir`.
    fn list(&self, dir: &[String]) -> Result<Vec<String>>;
}

/// JSON files on the local file system.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }

    fn dir_path(&self, dir: &[String]) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in dir {
            check_segment(segment)?;
            path.push(segment);
        }
        Ok(path)
    }
}

fn check_segment(segment: &str) -> Result<()> {
    let valid = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidPath(segment.to_string()))
    }
}

fn io_error(path: &FsPath, source: std::io::Error) -> Error {
    Error::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

impl RecordStore for FileStore {
    fn write(&self, dir: &[String], name: &str, record: &Value) -> Result<()> {
        check_segment(name)?;
        let dir_path = self.dir_path(dir)?;
        std::fs::create_dir_all(&dir_path).map_err(|e| io_error(&dir_path, e))?;

        // Write to a sibling temp file, then rename, so readers never see a partial record.
        let file_path = dir_path.join(format!("{name}.json"));
        let tmp_path = dir_path.join(format!(".{name}.json.tmp"));
        let bytes = serde_json::to_vec(record)?;
        std::fs::write(&tmp_path, bytes).map_err(|e| io_error(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &file_path).map_err(|e| io_error(&file_path, e))?;
        Ok(())
    }

    fn read(&self, dir: &[String], name: &str) -> Result<Option<Value>> {
        check_segment(name)?;
        let file_path = self.dir_path(dir)?.join(format!("{name}.json"));
        let bytes = match std::fs::read(&file_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&file_path, e)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn list(&self, dir: &[String]) -> Result<Vec<String>> {
        let dir_path = self.dir_path(dir)?;
        let entries = match std::fs::read_dir(&dir_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir_path, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&dir_path, e))?;
            let is_dir = entry
                .file_type()
                .map_err(|e| io_error(&entry.path(), e))?
                .is_dir();
            if is_dir {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segs(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn write_read_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store
            .write(&segs(&["root", "c1"]), "conversation", &json!({"a": 1}))
            .unwrap();
        store
            .write(&segs(&["root", "c1", "m1", "c2"]), "conversation", &json!({"b": 2}))
            .unwrap();

        let read = store.read(&segs(&["root", "c1"]), "conversation").unwrap();
        assert_eq!(read, Some(json!({"a": 1})));
        assert_eq!(store.list(&segs(&["root"])).unwrap(), vec!["c1"]);
        assert_eq!(store.list(&segs(&["root", "c1"])).unwrap(), vec!["m1"]);
    }

    #[test]
    fn missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert_eq!(store.read(&segs(&["root"]), "nope").unwrap(), None);
        assert!(store.list(&segs(&["root", "x"])).unwrap().is_empty());
    }

    #[test]
    fn rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let err = store
            .write(&segs(&["root", ".."]), "conversation", &json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[test]
    fn io_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is expected.
        std::fs::write(dir.path().join("root"), b"x").unwrap();
        let store = FileStore::new(dir.path());
        let err = store
            .write(&segs(&["root", "c1"]), "conversation", &json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
    }
}
