//! On-disk catalog: load with id checks and atomic whole-file checkpoints.

use crate::ids::IdAllocator;
use crate::record::KernelCandidate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read catalog {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write catalog {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("malformed catalog {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("catalog {} has format version {found}, expected {expected}", .path.display(), expected = FORMAT_VERSION)]
    UnsupportedVersion { path: PathBuf, found: u32 },
    #[error("catalog {} lists kernel id {id} more than once", .path.display())]
    DuplicateId { path: PathBuf, id: u64 },
    #[error("failed to encode catalog: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Flat list of accepted kernels, kept in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelCatalog {
    format_version: u32,
    kernels: Vec<KernelCandidate>,
}

impl Default for KernelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelCatalog {
    pub fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            kernels: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn kernels(&self) -> &[KernelCandidate] {
        &self.kernels
    }

    pub fn get(&self, index: usize) -> Option<&KernelCandidate> {
        self.kernels.get(index)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.kernels.iter().map(|k| k.id)
    }

    /// Allocator that will never hand out an id already in this catalog.
    pub fn id_allocator(&self) -> IdAllocator {
        IdAllocator::from_ids(self.ids())
    }

    pub fn push(&mut self, candidate: KernelCandidate) {
        self.kernels.push(candidate);
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    fn first_duplicate_id(&self) -> Option<u64> {
        let mut seen = HashSet::with_capacity(self.kernels.len());
        self.ids().find(|id| !seen.insert(*id))
    }

    /// A missing file yields an empty catalog. Every id in a loaded file must
    /// be unique.
    pub fn load_from_file(path: &Path) -> Result<Self, PersistenceError> {
        if !path.exists() {
            debug!(path = %path.display(), "no existing catalog, starting empty");
            return Ok(Self::new());
        }
        let data = fs::read(path).map_err(|source| PersistenceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog: KernelCatalog =
            serde_json::from_slice(&data).map_err(|source| PersistenceError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        if catalog.format_version != FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: catalog.format_version,
            });
        }
        if let Some(id) = catalog.first_duplicate_id() {
            return Err(PersistenceError::DuplicateId {
                path: path.to_path_buf(),
                id,
            });
        }
        info!(path = %path.display(), kernels = catalog.len(), "loaded catalog");
        Ok(catalog)
    }

    /// Replace the file at `path` with a complete snapshot. The snapshot is
    /// written beside the target and renamed over it, so readers see either
    /// the previous file or the new one.
    pub fn save_to_file(&self, path: &Path) -> Result<(), PersistenceError> {
        let write_err = |source| PersistenceError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }
        let blob = self.to_json_bytes()?;
        let tmp = tmp_path(path);
        let mut file = File::create(&tmp).map_err(write_err)?;
        file.write_all(&blob).map_err(write_err)?;
        file.flush().map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);
        fs::rename(&tmp, path).map_err(write_err)?;
        debug!(path = %path.display(), kernels = self.len(), "catalog written");
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::build_version;
    use kernelvault_ir::{CudaDim, MappingOptions, TensorDescriptor};

    fn candidate(id: u64, source: &str) -> KernelCandidate {
        KernelCandidate {
            id,
            program: "def f(float(N) I) -> (O) { O(n) = I(n) }".into(),
            entry_point: "f".into(),
            inputs: vec![TensorDescriptor::float32(&[64])],
            outputs: vec![TensorDescriptor::float32(&[64])],
            options: MappingOptions::naive(),
            kernel_source: source.into(),
            specialized_name: "f_64".into(),
            parameters: vec![64],
            tight_block: CudaDim::new(32, 1, 1),
            tight_grid: CudaDim::new(2, 1, 1),
            build_version: build_version(),
            compilation_time_ms: 1,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = KernelCatalog::load_from_file(&dir.path().join("none.json")).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_save_load_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.json");
        let mut catalog = KernelCatalog::new();
        catalog.push(candidate(4, "a"));
        catalog.push(candidate(1, "b"));
        catalog.save_to_file(&path).unwrap();
        let first = fs::read(&path).unwrap();

        let loaded = KernelCatalog::load_from_file(&path).unwrap();
        assert_eq!(loaded, catalog);
        loaded.save_to_file(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_malformed_and_versioned_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            KernelCatalog::load_from_file(&path),
            Err(PersistenceError::Malformed { .. })
        ));

        fs::write(&path, br#"{ "format_version": 9, "kernels": [] }"#).unwrap();
        assert!(matches!(
            KernelCatalog::load_from_file(&path),
            Err(PersistenceError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.json");
        let mut catalog = KernelCatalog::new();
        catalog.push(candidate(0, "a"));
        catalog.push(candidate(3, "b"));
        catalog.push(candidate(0, "c"));
        catalog.save_to_file(&path).unwrap();

        assert!(matches!(
            KernelCatalog::load_from_file(&path),
            Err(PersistenceError::DuplicateId { id: 0, .. })
        ));
    }

    #[test]
    fn test_reloaded_ids_feed_allocator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.json");
        let mut catalog = KernelCatalog::new();
        catalog.push(candidate(0, "old"));
        catalog.push(candidate(2, "two"));
        catalog.save_to_file(&path).unwrap();

        let mut ids = KernelCatalog::load_from_file(&path).unwrap().id_allocator();
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 3);
    }
}
