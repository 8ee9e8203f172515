//! Random mapping-option draws bounded by the largest input dimension.

use crate::shapes::TileLayout;
use kernelvault_ir::{
    CudaDim, FusionStrategy, MappingOptions, ScheduleOptions, ShapeSignature, MAX_BLOCK_X,
    MAX_BLOCK_Y, MAX_BLOCK_Z, MAX_GRID_X, MAX_GRID_YZ, MAX_THREADS_PER_BLOCK,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fewest threads a sampled block may carry.
pub const MIN_SAMPLED_THREADS: u64 = 32;
pub const MAX_SHARED_DEPTH: u32 = 7;
pub const MAX_PRIVATE_DEPTH: u32 = 10;

/// Bounds on every retry loop in the search layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SamplerLimits {
    /// Rejection draws for block or grid before switching strategy.
    pub max_attempts: u32,
    /// Resamples for one shape when every draw repeats an issued option.
    pub max_collisions: u32,
    /// Back-to-back compile failures before a shape is retired.
    pub max_consecutive_failures: u32,
    /// Signature draws allowed per requested shape while building a catalog.
    pub shape_draws_per_shape: usize,
}

impl Default for SamplerLimits {
    fn default() -> Self {
        Self {
            max_attempts: 1000,
            max_collisions: 1000,
            max_consecutive_failures: 50,
            shape_draws_per_shape: 1000,
        }
    }
}

impl SamplerLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be positive".into());
        }
        if self.max_consecutive_failures == 0 {
            return Err("max_consecutive_failures must be positive".into());
        }
        if self.shape_draws_per_shape == 0 {
            return Err("shape_draws_per_shape must be positive".into());
        }
        Ok(())
    }
}

pub fn block_in_bounds(block: &CudaDim) -> bool {
    let threads = block.product();
    block.x >= 1
        && block.y >= 1
        && block.z >= 1
        && block.x <= MAX_BLOCK_X
        && block.y <= MAX_BLOCK_Y
        && block.z <= MAX_BLOCK_Z
        && (MIN_SAMPLED_THREADS..=MAX_THREADS_PER_BLOCK).contains(&threads)
}

pub fn grid_in_bounds(grid: &CudaDim, min_blocks: u64) -> bool {
    grid.x >= 1
        && grid.y >= 1
        && grid.z >= 1
        && grid.x <= MAX_GRID_X
        && grid.y <= MAX_GRID_YZ
        && grid.z <= MAX_GRID_YZ
        && grid.product() >= min_blocks
}

/// Draws mapping options for one input shape.
///
/// Every random value comes from a private seeded generator in a fixed
/// order, so two samplers built with the same arguments yield the same
/// sequence.
pub struct OptionSampler {
    max_size: u64,
    layout: TileLayout,
    min_blocks: u64,
    limits: SamplerLimits,
    rng: fastrand::Rng,
    fallbacks: u64,
}

impl OptionSampler {
    pub fn new(
        signature: &ShapeSignature,
        layout: TileLayout,
        min_blocks: u64,
        limits: SamplerLimits,
        seed: u64,
    ) -> Self {
        Self {
            max_size: signature.max_dim().unwrap_or(1).max(1),
            layout,
            min_blocks: min_blocks.max(1),
            limits,
            rng: fastrand::Rng::with_seed(seed),
            fallbacks: 0,
        }
    }

    /// Draws that ended in a fixed fallback block or grid.
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }

    pub fn sample(&mut self) -> MappingOptions {
        let outer = self.fusion();
        let intra = self.fusion();
        let tile = self.tiles();
        let block = self.block();
        let grid = self.grid();
        let tile_imperfectly_nested = self.rng.bool();
        let unroll = self.rng.u64(1..=self.max_size);
        let use_shared_memory = self.rng.bool();
        let use_private_memory = self.rng.bool();
        let use_read_only_cache = self.rng.bool();

        let mut unroll_copy_shared = false;
        let mut shared_depth = 0;
        if use_shared_memory {
            unroll_copy_shared = self.rng.bool();
            shared_depth = self.rng.u32(0..=MAX_SHARED_DEPTH);
        }
        let private_depth = if use_private_memory {
            self.rng.u32(0..=MAX_PRIVATE_DEPTH)
        } else {
            0
        };

        MappingOptions {
            outer_schedule: ScheduleOptions::new(outer, true),
            intra_tile_schedule: ScheduleOptions::new(intra, true),
            tile,
            block,
            grid,
            tile_imperfectly_nested,
            use_shared_memory,
            use_private_memory,
            use_read_only_cache,
            unroll_copy_shared,
            unroll,
            shared_depth,
            private_depth,
            match_library_calls: false,
        }
        .normalized()
    }

    fn fusion(&mut self) -> FusionStrategy {
        FusionStrategy::ALL[self.rng.usize(..FusionStrategy::ALL.len())]
    }

    fn tiles(&mut self) -> Vec<u64> {
        (0..self.layout.dims)
            .map(|dim| {
                if dim < self.layout.fixed {
                    1
                } else {
                    self.rng.u64(0..=self.max_size)
                }
            })
            .collect()
    }

    fn block(&mut self) -> CudaDim {
        for _ in 0..self.limits.max_attempts {
            let block = CudaDim::new(
                self.rng.u64(1..=self.max_size),
                self.rng.u64(1..=self.max_size),
                self.rng.u64(1..=self.max_size),
            );
            if block_in_bounds(&block) {
                return block;
            }
        }
        for _ in 0..self.limits.max_attempts {
            let x = self.rng.u64(1..=self.max_size.min(MAX_BLOCK_X));
            let y_cap = self.max_size.min(MAX_BLOCK_Y).min(MAX_THREADS_PER_BLOCK / x);
            let y = self.rng.u64(1..=y_cap.max(1));
            let z_cap = self
                .max_size
                .min(MAX_BLOCK_Z)
                .min(MAX_THREADS_PER_BLOCK / (x * y));
            let z = self.rng.u64(1..=z_cap.max(1));
            let block = CudaDim::new(x, y, z);
            if block_in_bounds(&block) {
                return block;
            }
        }
        self.fallbacks += 1;
        debug!(max_size = self.max_size, "block draw fell back to 32x1x1");
        CudaDim::new(MIN_SAMPLED_THREADS, 1, 1)
    }

    fn grid(&mut self) -> CudaDim {
        for _ in 0..self.limits.max_attempts {
            let grid = CudaDim::new(
                self.rng.u64(1..=self.max_size),
                self.rng.u64(1..=self.max_size),
                self.rng.u64(1..=self.max_size),
            );
            if grid_in_bounds(&grid, self.min_blocks) {
                return grid;
            }
        }
        let x_cap = self.max_size.min(MAX_GRID_X);
        let yz_cap = self.max_size.min(MAX_GRID_YZ);
        for _ in 0..self.limits.max_attempts {
            let x = self.rng.u64(1..=x_cap);
            let y = self.rng.u64(1..=yz_cap);
            let z_floor = self.min_blocks.div_ceil(x * y).max(1);
            if z_floor > yz_cap {
                continue;
            }
            let grid = CudaDim::new(x, y, self.rng.u64(z_floor..=yz_cap));
            if grid_in_bounds(&grid, self.min_blocks) {
                return grid;
            }
        }
        self.fallbacks += 1;
        debug!(
            max_size = self.max_size,
            min_blocks = self.min_blocks,
            "grid draw fell back to a flat grid"
        );
        CudaDim::new(self.min_blocks.min(MAX_GRID_X), 1, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelvault_ir::TensorDescriptor;

    fn sampler_for(shape: &[u64], layout: TileLayout, seed: u64) -> OptionSampler {
        let sig = ShapeSignature::new(vec![TensorDescriptor::float32(shape)]);
        OptionSampler::new(&sig, layout, 56, SamplerLimits::default(), seed)
    }

    #[test]
    fn test_sampled_options_respect_bounds() {
        let mut sampler = sampler_for(&[64, 128], TileLayout::new(3, 1), 1);
        for _ in 0..500 {
            let options = sampler.sample();
            assert!(block_in_bounds(&options.block), "{}", options.block);
            assert!(grid_in_bounds(&options.grid, 56), "{}", options.grid);
            assert_eq!(options.tile.len(), 3);
            assert_eq!(options.tile[0], 1);
            assert!(options.tile.iter().all(|&t| t <= 128));
            assert!((1..=128).contains(&options.unroll));
            assert!(options.shared_depth <= MAX_SHARED_DEPTH);
            assert!(options.private_depth <= MAX_PRIVATE_DEPTH);
            assert!(options.outer_schedule.allow_skewing);
            assert!(!options.match_library_calls);
            assert!(options.is_normalized());
            assert!(options.validate().is_ok());
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = sampler_for(&[32, 48], TileLayout::new(3, 2), 99);
        let mut b = sampler_for(&[32, 48], TileLayout::new(3, 2), 99);
        for _ in 0..20 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    #[test]
    fn test_huge_dimension_uses_constructive_block() {
        // Uniform draws over [1, 4000]^3 almost never land under 1024 threads.
        let mut sampler = sampler_for(&[4000], TileLayout::new(3, 1), 5);
        for _ in 0..50 {
            let options = sampler.sample();
            assert!(block_in_bounds(&options.block));
            assert!(grid_in_bounds(&options.grid, 56));
        }
    }

    #[test]
    fn test_tiny_dimension_falls_back() {
        // Max size 2 cannot reach 32 threads or 56 blocks.
        let mut sampler = sampler_for(&[2, 2], TileLayout::new(1, 1), 3);
        let options = sampler.sample();
        assert_eq!(options.block, CudaDim::new(32, 1, 1));
        assert_eq!(options.grid, CudaDim::new(56, 1, 1));
        assert_eq!(sampler.fallbacks(), 2);
    }

    #[test]
    fn test_limits_validate() {
        assert!(SamplerLimits::default().validate().is_ok());
        let limits = SamplerLimits {
            max_attempts: 0,
            ..SamplerLimits::default()
        };
        assert!(limits.validate().is_err());
    }
}
