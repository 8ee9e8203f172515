//! Generator configuration.

use anyhow::{bail, Context, Result};
use kernelvault_backend::timed::DEFAULT_MAX_ABANDONED;
use kernelvault_ir::{MAX_GRID_X, MAX_GRID_YZ};
use kernelvault_search::{SamplerLimits, ShapeRanges, WorkloadFamily};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LockStrategy {
    /// One mutex over every shape.
    #[default]
    Global,
    /// One mutex per shape.
    PerShape,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TargetMode {
    /// Stop once total successes reach shapes x options.
    #[default]
    Shared,
    /// Stop once every shape has met its own quota.
    PerShape,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub family: WorkloadFamily,
    pub shapes: usize,
    pub options_per_shape: usize,
    pub workers: usize,
    pub output: PathBuf,
    pub checkpoint_every: u64,
    pub seed: Option<u64>,
    pub min_blocks: Option<u64>,
    pub lock_strategy: LockStrategy,
    pub target_mode: TargetMode,
    pub compile_timeout_ms: Option<u64>,
    /// Timed-out compilations that may keep running in the background.
    pub max_abandoned_compiles: usize,
    pub limits: SamplerLimits,
    pub ranges: ShapeRanges,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            family: WorkloadFamily::GroupConvolution,
            shapes: 100,
            options_per_shape: 10,
            workers: 1,
            output: PathBuf::from("kernels.json"),
            checkpoint_every: 100,
            seed: None,
            min_blocks: None,
            lock_strategy: LockStrategy::Global,
            target_mode: TargetMode::Shared,
            compile_timeout_ms: None,
            max_abandoned_compiles: DEFAULT_MAX_ABANDONED,
            limits: SamplerLimits::default(),
            ranges: ShapeRanges::default(),
        }
    }
}

impl GeneratorConfig {
    pub fn for_family(family: WorkloadFamily) -> Self {
        Self {
            family,
            ..Self::default()
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn min_blocks(&self) -> u64 {
        self.min_blocks
            .unwrap_or_else(|| self.family.default_min_blocks())
    }

    pub fn compile_timeout(&self) -> Option<Duration> {
        self.compile_timeout_ms.map(Duration::from_millis)
    }

    pub fn target(&self) -> u64 {
        (self.shapes as u64).saturating_mul(self.options_per_shape as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shapes == 0 {
            bail!("number of shapes must be positive");
        }
        if self.options_per_shape == 0 {
            bail!("options per shape must be positive");
        }
        if self.workers == 0 {
            bail!("worker count must be positive");
        }
        if self.checkpoint_every == 0 {
            bail!("checkpoint interval must be positive");
        }
        if self.compile_timeout_ms == Some(0) {
            bail!("compile timeout must be positive when set");
        }
        if self.max_abandoned_compiles == 0 {
            bail!("max abandoned compiles must be positive");
        }
        let min_blocks = self.min_blocks();
        let max_blocks = MAX_GRID_X
            .saturating_mul(MAX_GRID_YZ)
            .saturating_mul(MAX_GRID_YZ);
        if min_blocks == 0 || min_blocks > max_blocks {
            bail!("minimum blocks per grid {min_blocks} is outside 1..={max_blocks}");
        }
        self.limits
            .validate()
            .map_err(|msg| anyhow::anyhow!("sampler limits: {msg}"))?;
        self.ranges
            .validate()
            .map_err(|msg| anyhow::anyhow!("shape ranges: {msg}"))?;
        Ok(())
    }
}
