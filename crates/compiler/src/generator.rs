//! The generation loop: reserve, compile, judge, record, checkpoint.

use crate::config::GeneratorConfig;
use crate::context::{GenerationContext, StopFlag};
use crate::pool::{PoolState, WorkerPool};
use anyhow::{Context, Result};
use kernelvault_backend::BackendCompiler;
use kernelvault_catalog::{build_version, KernelCandidate};
use kernelvault_search::{Reservation, Verdict};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pause before asking the issuer again while other workers still hold
/// reservations that may be released.
const IDLE_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub attempts: u64,
    pub successes: u64,
    pub compile_failures: u64,
    pub rejections: u64,
    pub checkpoint_failures: u64,
    pub catalog_size: usize,
    pub elapsed_ms: u64,
    pub stopped_early: bool,
}

pub struct Generator {
    ctx: Arc<GenerationContext>,
    pool: WorkerPool,
    checkpoint_failures: AtomicU64,
}

impl Generator {
    pub fn new(ctx: Arc<GenerationContext>, workers: usize) -> Result<Self> {
        Ok(Self {
            ctx,
            pool: WorkerPool::new(workers)?,
            checkpoint_failures: AtomicU64::new(0),
        })
    }

    pub fn from_config(
        config: &GeneratorConfig,
        backend: Arc<dyn BackendCompiler>,
        stop: StopFlag,
    ) -> Result<Self> {
        let ctx = GenerationContext::from_config(config, backend, stop)?;
        Self::new(Arc::new(ctx), config.workers)
    }

    pub fn context(&self) -> &GenerationContext {
        &self.ctx
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    /// Drive every worker until the target is reached, the issuer runs dry or
    /// a stop is requested, then write one final checkpoint.
    pub fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        info!(
            workers = self.pool.workers(),
            target = self.ctx.target(),
            output = %self.ctx.output().display(),
            "starting generation"
        );

        self.pool.run(|worker| self.worker_loop(worker));

        let written = self
            .ctx
            .checkpoint()
            .with_context(|| format!("final checkpoint to {}", self.ctx.output().display()))?;

        let counters = self.ctx.counters().snapshot();
        let summary = RunSummary {
            attempts: counters.attempts,
            successes: counters.successes,
            compile_failures: counters.compile_failures,
            rejections: counters.rejections,
            checkpoint_failures: self.checkpoint_failures.load(Ordering::SeqCst),
            catalog_size: written,
            elapsed_ms: started.elapsed().as_millis() as u64,
            stopped_early: self.ctx.stop_flag().is_stopped() && !self.ctx.target_reached(),
        };
        info!(
            attempts = summary.attempts,
            successes = summary.successes,
            compile_failures = summary.compile_failures,
            rejections = summary.rejections,
            catalog_size = summary.catalog_size,
            elapsed_ms = summary.elapsed_ms,
            stopped_early = summary.stopped_early,
            "generation finished"
        );
        Ok(summary)
    }

    fn worker_loop(&self, worker: usize) {
        let issuer = self.ctx.issuer();
        loop {
            if self.ctx.stop_flag().is_stopped() {
                if self.pool.begin_draining() {
                    info!(worker, "stop requested, draining workers");
                }
                break;
            }
            if self.ctx.target_reached() {
                self.pool.begin_draining();
                break;
            }
            let Some(reservation) = issuer.reserve() else {
                if issuer.pending() == 0 {
                    if self.pool.begin_draining() {
                        info!(worker, "option space exhausted");
                    }
                    break;
                }
                thread::sleep(IDLE_BACKOFF);
                continue;
            };
            self.process(worker, reservation);
        }
        debug!(worker, "worker exiting");
    }

    fn process(&self, worker: usize, reservation: Reservation) {
        let ctx = &*self.ctx;
        let issuer = ctx.issuer();
        let backend = ctx.backend();
        let attempts = ctx.counters().attempt();

        let started = Instant::now();
        let compiled = backend.compile(
            ctx.program(),
            ctx.entry_point(),
            &reservation.signature,
            &reservation.options,
        );
        let compilation_time_ms = started.elapsed().as_millis() as u64;

        let kernel = match compiled {
            Ok(kernel) => kernel,
            Err(err) => {
                let failures = ctx.counters().compile_failure();
                issuer.discard(&reservation);
                warn!(
                    worker,
                    attempts,
                    failures,
                    shape = %reservation.signature,
                    error = %err,
                    "compilation failed"
                );
                return;
            }
        };

        if let Verdict::Rejected(reason) = ctx.policy().evaluate(&kernel.block, &kernel.grid) {
            let rejections = ctx.counters().rejection();
            issuer.release(&reservation);
            debug!(
                worker,
                attempts,
                rejections,
                kernel = %kernel.specialized_name,
                %reason,
                "candidate rejected after tightening"
            );
            return;
        }

        let outputs = match backend.infer_output_shapes(
            ctx.program(),
            ctx.entry_point(),
            &reservation.signature,
        ) {
            Ok(outputs) => outputs,
            Err(err) => {
                ctx.counters().compile_failure();
                issuer.discard(&reservation);
                warn!(worker, error = %err, "output shape inference failed");
                return;
            }
        };

        let id = ctx.allocate_id();
        ctx.record(KernelCandidate {
            id,
            program: ctx.program().to_string(),
            entry_point: ctx.entry_point().to_string(),
            inputs: reservation.signature.descriptors().to_vec(),
            outputs,
            options: reservation.options.clone(),
            kernel_source: kernel.source,
            specialized_name: kernel.specialized_name,
            parameters: kernel.parameters,
            tight_block: kernel.block,
            tight_grid: kernel.grid,
            build_version: build_version(),
            compilation_time_ms,
        });
        issuer.commit(&reservation);

        let successes = ctx.counters().success();
        info!(worker, id, attempts, successes, compilation_time_ms, "kernel accepted");

        if successes % ctx.checkpoint_every() == 0 {
            match ctx.checkpoint() {
                Ok(kernels) => info!(kernels, "checkpoint written"),
                Err(err) => {
                    self.checkpoint_failures.fetch_add(1, Ordering::SeqCst);
                    error!(error = %err, "checkpoint failed, keeping results in memory");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelvault_backend::{CompilationError, CompiledKernel};
    use kernelvault_catalog::KernelCatalog;
    use kernelvault_ir::{MappingOptions, ShapeSignature};
    use kernelvault_search::WorkloadFamily;
    use std::path::Path;

    /// Launches exactly what was requested.
    struct EchoBackend;

    impl BackendCompiler for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        fn compile(
            &self,
            _program: &str,
            entry: &str,
            _inputs: &ShapeSignature,
            options: &MappingOptions,
        ) -> Result<CompiledKernel, CompilationError> {
            Ok(CompiledKernel {
                source: format!("// {options}"),
                specialized_name: entry.to_string(),
                parameters: vec![1],
                grid: options.grid,
                block: options.block,
            })
        }
    }

    struct FailingBackend;

    impl BackendCompiler for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        fn compile(
            &self,
            _program: &str,
            entry: &str,
            _inputs: &ShapeSignature,
            _options: &MappingOptions,
        ) -> Result<CompiledKernel, CompilationError> {
            Err(CompilationError::UnknownEntryPoint(entry.to_string()))
        }
    }

    fn config(dir: &Path) -> GeneratorConfig {
        GeneratorConfig {
            family: WorkloadFamily::Mlp3,
            shapes: 2,
            options_per_shape: 3,
            workers: 1,
            seed: Some(9),
            checkpoint_every: 2,
            output: dir.join("kernels.json"),
            ..GeneratorConfig::default()
        }
    }

    #[test]
    fn test_generates_target_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let generator =
            Generator::from_config(&config, Arc::new(EchoBackend), StopFlag::new()).unwrap();
        let summary = generator.run().unwrap();

        assert_eq!(summary.successes, 6);
        assert_eq!(summary.attempts, 6);
        assert_eq!(summary.catalog_size, 6);
        assert!(!summary.stopped_early);
        assert_eq!(generator.pool_state(), PoolState::Stopped);

        let catalog = KernelCatalog::load_from_file(&config.output).unwrap();
        assert_eq!(catalog.ids().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
        assert!(catalog.kernels().iter().all(|k| k.outputs.len() == 3));
    }

    #[test]
    fn test_failures_never_stall() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.limits.max_consecutive_failures = 4;
        let generator =
            Generator::from_config(&config, Arc::new(FailingBackend), StopFlag::new()).unwrap();
        let summary = generator.run().unwrap();

        assert_eq!(summary.successes, 0);
        assert_eq!(summary.compile_failures, 8);
        assert_eq!(summary.catalog_size, 0);
        assert!(config.output.exists());
    }

    #[test]
    fn test_stop_before_start_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let stop = StopFlag::new();
        stop.request_stop();
        let generator = Generator::from_config(&config, Arc::new(EchoBackend), stop).unwrap();
        let summary = generator.run().unwrap();

        assert_eq!(summary.attempts, 0);
        assert!(summary.stopped_early);
        assert!(KernelCatalog::load_from_file(&config.output)
            .unwrap()
            .is_empty());
    }
}
