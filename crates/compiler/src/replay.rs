//! Compile an explicit list of (inputs, options) pairs into a fresh catalog.

use crate::context::check_entry_point;
use crate::pool::WorkerPool;
use anyhow::{bail, Context, Result};
use kernelvault_backend::BackendCompiler;
use kernelvault_catalog::{build_version, IdAllocator, KernelCandidate, KernelCatalog};
use kernelvault_ir::{MappingOptions, ShapeSignature, TensorDescriptor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayEntry {
    pub inputs: Vec<TensorDescriptor>,
    pub options: MappingOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplaySummary {
    pub entries: usize,
    pub compiled: u64,
    pub failures: u64,
    pub elapsed_ms: u64,
}

pub fn load_entries(path: &Path) -> Result<Vec<ReplayEntry>> {
    if !path.exists() {
        bail!("input file {} does not exist", path.display());
    }
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let entries = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse replay entries from {}", path.display()))?;
    Ok(entries)
}

/// Compiles every entry once. There is no acceptance filter: whatever the
/// backend produces is kept.
pub struct Replayer {
    program: String,
    entry_point: String,
    backend: Arc<dyn BackendCompiler>,
    workers: usize,
}

impl Replayer {
    pub fn new(
        program: impl Into<String>,
        entry_point: impl Into<String>,
        backend: Arc<dyn BackendCompiler>,
        workers: usize,
    ) -> Self {
        Self {
            program: program.into(),
            entry_point: entry_point.into(),
            backend,
            workers: workers.max(1),
        }
    }

    /// Refuses to touch an existing `output`; the catalog is written once,
    /// after every entry has been attempted.
    pub fn run(&self, entries: &[ReplayEntry], output: &Path) -> Result<ReplaySummary> {
        if output.exists() {
            bail!("{} already exists", output.display());
        }
        check_entry_point(&self.program, &self.entry_point)?;
        let started = Instant::now();
        let pool = WorkerPool::new(self.workers)?;
        let next = AtomicUsize::new(0);
        let failures = AtomicU64::new(0);
        let ids = Mutex::new(IdAllocator::new());
        let catalog = Mutex::new(KernelCatalog::new());

        pool.run(|worker| loop {
            let index = next.fetch_add(1, Ordering::SeqCst);
            let Some(entry) = entries.get(index) else {
                break;
            };
            match self.compile_entry(entry) {
                Ok(mut candidate) => {
                    candidate.id = ids
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .allocate();
                    info!(worker, index, id = candidate.id, "replayed entry");
                    catalog
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(candidate);
                }
                Err(err) => {
                    failures.fetch_add(1, Ordering::SeqCst);
                    warn!(worker, index, error = %err, "replay entry failed");
                }
            }
        });

        let catalog = catalog.into_inner().unwrap_or_else(PoisonError::into_inner);
        catalog
            .save_to_file(output)
            .with_context(|| format!("failed to write {}", output.display()))?;

        let summary = ReplaySummary {
            entries: entries.len(),
            compiled: catalog.len() as u64,
            failures: failures.load(Ordering::SeqCst),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            entries = summary.entries,
            compiled = summary.compiled,
            failures = summary.failures,
            "replay finished"
        );
        Ok(summary)
    }

    fn compile_entry(&self, entry: &ReplayEntry) -> Result<KernelCandidate> {
        let inputs = ShapeSignature::new(entry.inputs.clone());
        let started = Instant::now();
        let kernel = self
            .backend
            .compile(&self.program, &self.entry_point, &inputs, &entry.options)?;
        let compilation_time_ms = started.elapsed().as_millis() as u64;
        let outputs = self
            .backend
            .infer_output_shapes(&self.program, &self.entry_point, &inputs)?;
        Ok(KernelCandidate {
            id: 0,
            program: self.program.clone(),
            entry_point: self.entry_point.clone(),
            inputs: entry.inputs.clone(),
            outputs,
            options: entry.options.clone(),
            kernel_source: kernel.source,
            specialized_name: kernel.specialized_name,
            parameters: kernel.parameters,
            tight_block: kernel.block,
            tight_grid: kernel.grid,
            build_version: build_version(),
            compilation_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelvault_backend::ReferenceBackend;
    use kernelvault_ir::{library, CudaDim};

    fn entries() -> Vec<ReplayEntry> {
        let shapes: [&[u64]; 7] = [&[4, 64], &[32, 64], &[32], &[48, 32], &[48], &[8, 48], &[8]];
        let inputs: Vec<_> = shapes.iter().map(|s| TensorDescriptor::float32(s)).collect();
        let good = MappingOptions::naive().with_tile(vec![1, 8, 8]);
        let bad = MappingOptions::naive().with_block(CudaDim::new(0, 1, 1));
        vec![
            ReplayEntry {
                inputs: inputs.clone(),
                options: good.clone(),
            },
            ReplayEntry {
                inputs: inputs.clone(),
                options: bad,
            },
            ReplayEntry {
                inputs,
                options: good.with_grid(CudaDim::new(2, 2, 1)),
            },
        ]
    }

    #[test]
    fn test_replay_compiles_every_valid_entry() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("replayed.json");
        let replayer = Replayer::new(library::MLP3, "mlp3", Arc::new(ReferenceBackend), 2);
        let summary = replayer.run(&entries(), &output).unwrap();
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.compiled, 2);
        assert_eq!(summary.failures, 1);

        let catalog = KernelCatalog::load_from_file(&output).unwrap();
        let mut ids: Vec<_> = catalog.ids().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_replay_refuses_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("exists.json");
        fs::write(&output, "{}").unwrap();
        let replayer = Replayer::new(library::MLP3, "mlp3", Arc::new(ReferenceBackend), 1);
        assert!(replayer.run(&entries(), &output).is_err());
        assert_eq!(fs::read_to_string(&output).unwrap(), "{}");
    }

    #[test]
    fn test_entries_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.json");
        fs::write(&path, serde_json::to_vec(&entries()).unwrap()).unwrap();
        assert_eq!(load_entries(&path).unwrap().len(), 3);
        assert!(load_entries(&dir.path().join("missing.json")).is_err());
    }
}
