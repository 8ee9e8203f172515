//! Shared state for one generation run.

use crate::config::{GeneratorConfig, LockStrategy, TargetMode};
use anyhow::{bail, Context, Result};
use kernelvault_backend::{BackendCompiler, TimedBackend};
use kernelvault_catalog::{IdAllocator, KernelCandidate, KernelCatalog, PersistenceError};
use kernelvault_search::{
    AcceptancePolicy, IssuerConfig, OptionIssuer, ShapeOptionCatalog, StripedShapeOptionCatalog,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parse `program` and make sure it defines `entry`.
pub fn check_entry_point(program: &str, entry: &str) -> Result<()> {
    let parsed = kernelvault_ir::parse(program).context("failed to parse workload program")?;
    if parsed.definition(entry).is_none() {
        let defined: Vec<&str> = parsed.entry_points().collect();
        bail!(
            "entry point `{entry}` is not defined (program defines: {})",
            defined.join(", ")
        );
    }
    Ok(())
}

/// Cooperative stop request, checked by workers between iterations.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    compile_failures: AtomicU64,
    rejections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub compile_failures: u64,
    pub rejections: u64,
}

impl Counters {
    /// Each bump returns the updated value.
    pub fn attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn success(&self) -> u64 {
        self.successes.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn compile_failure(&self) -> u64 {
        self.compile_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn rejection(&self) -> u64 {
        self.rejections.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            attempts: self.attempts.load(Ordering::SeqCst),
            successes: self.successes.load(Ordering::SeqCst),
            compile_failures: self.compile_failures.load(Ordering::SeqCst),
            rejections: self.rejections.load(Ordering::SeqCst),
        }
    }
}

/// Everything the workers of one run share. Built once per run and handed
/// around behind an `Arc`.
pub struct GenerationContext {
    program: String,
    entry_point: String,
    issuer: Arc<dyn OptionIssuer>,
    backend: Arc<dyn BackendCompiler>,
    policy: AcceptancePolicy,
    ids: Mutex<IdAllocator>,
    catalog: Mutex<KernelCatalog>,
    checkpoint_lock: Mutex<()>,
    counters: Counters,
    stop: StopFlag,
    output: PathBuf,
    checkpoint_every: u64,
    target_mode: TargetMode,
    target: u64,
    seed: u64,
    preloaded: usize,
}

impl GenerationContext {
    /// Load any catalog already at the output path, draw the shape set and
    /// wire the backend. A catalog that cannot be read aborts here, before
    /// any work starts.
    pub fn from_config(
        config: &GeneratorConfig,
        backend: Arc<dyn BackendCompiler>,
        stop: StopFlag,
    ) -> Result<Self> {
        config.validate()?;
        let family = config.family;
        check_entry_point(family.program(), family.entry_point())?;

        let catalog = KernelCatalog::load_from_file(&config.output)
            .with_context(|| format!("cannot resume from {}", config.output.display()))?;
        let ids = catalog.id_allocator();
        let preloaded = catalog.len();

        let seed = config.seed.unwrap_or_else(|| fastrand::u64(..));
        let mut master = fastrand::Rng::with_seed(seed);
        let shape_seed = master.u64(..);
        let option_seed = master.u64(..);

        let mut shapes = family.sampler(&config.ranges, shape_seed);
        let issuer_config = IssuerConfig {
            shapes: config.shapes,
            options_per_shape: config.options_per_shape,
            layout: family.tile_layout(),
            min_blocks: config.min_blocks(),
            limits: config.limits,
            seed: option_seed,
        };
        let issuer: Arc<dyn OptionIssuer> = match config.lock_strategy {
            LockStrategy::Global => Arc::new(ShapeOptionCatalog::build(
                shapes.as_mut(),
                issuer_config,
            )?),
            LockStrategy::PerShape => Arc::new(StripedShapeOptionCatalog::build(
                shapes.as_mut(),
                issuer_config,
            )?),
        };

        let backend: Arc<dyn BackendCompiler> = match config.compile_timeout() {
            Some(deadline) => Arc::new(
                TimedBackend::new(backend, deadline)
                    .with_max_abandoned(config.max_abandoned_compiles),
            ),
            None => backend,
        };

        info!(
            family = %family,
            shapes = config.shapes,
            options_per_shape = config.options_per_shape,
            preloaded,
            seed,
            backend = backend.name(),
            "generation context ready"
        );

        Ok(Self {
            program: family.program().to_string(),
            entry_point: family.entry_point().to_string(),
            issuer,
            backend,
            policy: AcceptancePolicy::new(config.min_blocks()),
            ids: Mutex::new(ids),
            catalog: Mutex::new(catalog),
            checkpoint_lock: Mutex::new(()),
            counters: Counters::default(),
            stop,
            output: config.output.clone(),
            checkpoint_every: config.checkpoint_every,
            target_mode: config.target_mode,
            target: config.target(),
            seed,
            preloaded,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn issuer(&self) -> &dyn OptionIssuer {
        self.issuer.as_ref()
    }

    pub fn backend(&self) -> &dyn BackendCompiler {
        self.backend.as_ref()
    }

    pub fn policy(&self) -> &AcceptancePolicy {
        &self.policy
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn checkpoint_every(&self) -> u64 {
        self.checkpoint_every
    }

    pub fn target_mode(&self) -> TargetMode {
        self.target_mode
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn preloaded(&self) -> usize {
        self.preloaded
    }

    /// True once the run has produced what was asked of it.
    pub fn target_reached(&self) -> bool {
        match self.target_mode {
            TargetMode::Shared => self.counters.successes() >= self.target,
            TargetMode::PerShape => self.issuer.quota_met(),
        }
    }

    pub fn allocate_id(&self) -> u64 {
        lock(&self.ids).allocate()
    }

    pub fn record(&self, candidate: KernelCandidate) {
        lock(&self.catalog).push(candidate);
    }

    pub fn catalog_snapshot(&self) -> KernelCatalog {
        lock(&self.catalog).clone()
    }

    /// Write the whole catalog to the output path. Snapshot and write both
    /// happen under the checkpoint lock, so a later checkpoint never lands
    /// before an earlier one.
    pub fn checkpoint(&self) -> Result<usize, PersistenceError> {
        let _guard = lock(&self.checkpoint_lock);
        let snapshot = self.catalog_snapshot();
        snapshot.save_to_file(&self.output)?;
        Ok(snapshot.len())
    }
}
