use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::error::StorageError;

use super::ObjectStore;

/// Object store backed by a directory tree. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a key to a path below the root, rejecting anything that
    /// could escape it.
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let invalid = |reason: &str| StorageError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        if key.contains('\\') {
            return Err(invalid("backslashes are not allowed"));
        }

        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::ParentDir => return Err(invalid("parent directory references are not allowed")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("absolute keys are not allowed"))
                }
                Component::CurDir => return Err(invalid("'.' segments are not allowed")),
            }
        }

        Ok(self.root.join(relative))
    }

    fn ensure_directory(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl ObjectStore for FileStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    key: key.to_string(),
                }
            } else {
                StorageError::ReadFile { path, source: e }
            }
        })
    }

    /// Writes to a uniquely named sibling first and renames it into place, so
    /// readers never observe a partially written object and concurrent
    /// writers of the same key leave one complete version behind.
    fn put(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            self.ensure_directory(parent)?;
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
            std::fs::rename(&temp_path, &path)
        };

        write().map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            StorageError::WriteFile {
                path: path.clone(),
                source: e,
            }
        })
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.path_for(key)?.is_file())
    }
}
