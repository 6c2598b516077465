//! Local system-state source inspected by the phase probes
//!
//! Provisioning progress is inferred from a hierarchical key/value tree
//! (keys contain subkeys and named values). `FsSystemState` mirrors that
//! tree on disk: every key is a directory and every value is a file whose
//! content is the value's text.

use nimbus_core::{NimbusError, Result};
use std::path::{Path, PathBuf};

/// Read-only view of the device's system-state tree
pub trait SystemState: Send + Sync {
    /// Fails when the tree as a whole cannot be inspected
    fn available(&self) -> Result<()>;

    /// Whether the key at `path` exists
    fn key_exists(&self, path: &str) -> Result<bool>;

    /// Names of the direct subkeys of `path` (sorted)
    fn subkeys(&self, path: &str) -> Result<Vec<String>>;

    /// Text of value `name` under key `path`, `None` when absent
    fn read_value(&self, path: &str, name: &str) -> Result<Option<String>>;
}

/// System-state tree stored as directories below a root
#[derive(Debug, Clone)]
pub struct FsSystemState {
    root: PathBuf,
}

impl FsSystemState {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for segment in path.split(|c: char| c == '/' || c == '\\').filter(|s| !s.is_empty()) {
            full.push(segment);
        }
        full
    }
}

impl SystemState for FsSystemState {
    fn available(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(NimbusError::Probe(format!(
                "system state root {} is not accessible",
                self.root.display()
            )))
        }
    }

    fn key_exists(&self, path: &str) -> Result<bool> {
        Ok(self.key_path(path).is_dir())
    }

    fn subkeys(&self, path: &str) -> Result<Vec<String>> {
        let dir = self.key_path(path);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_value(&self, path: &str, name: &str) -> Result<Option<String>> {
        let file = self.key_path(path).join(name);
        if !file.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&file)?;
        Ok(Some(content.trim().to_string()))
    }
}
