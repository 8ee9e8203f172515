//! Mapping options: the scheduling and code generation decisions a backend
//! consumes to produce one concrete kernel.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_BLOCK_X: u64 = 1024;
pub const MAX_BLOCK_Y: u64 = 1024;
pub const MAX_BLOCK_Z: u64 = 64;
pub const MAX_THREADS_PER_BLOCK: u64 = 1024;
pub const MAX_GRID_X: u64 = (1 << 31) - 1;
pub const MAX_GRID_YZ: u64 = (1 << 16) - 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FusionStrategy {
    Max,
    Min,
    Preserve3Coincident,
}

impl FusionStrategy {
    pub const ALL: [FusionStrategy; 3] = [
        FusionStrategy::Max,
        FusionStrategy::Preserve3Coincident,
        FusionStrategy::Min,
    ];
}

impl fmt::Display for FusionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FusionStrategy::Max => "Max",
            FusionStrategy::Min => "Min",
            FusionStrategy::Preserve3Coincident => "Preserve3Coincident",
        };
        f.write_str(name)
    }
}

fn one() -> u64 {
    1
}

/// A 3-d launch extent. `y` and `z` default to 1 when absent from a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CudaDim {
    pub x: u64,
    #[serde(default = "one")]
    pub y: u64,
    #[serde(default = "one")]
    pub z: u64,
}

impl CudaDim {
    pub const fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }

    pub const fn unit() -> Self {
        Self::new(1, 1, 1)
    }

    pub fn product(&self) -> u64 {
        self.x.saturating_mul(self.y).saturating_mul(self.z)
    }

    pub fn as_array(&self) -> [u64; 3] {
        [self.x, self.y, self.z]
    }
}

impl Default for CudaDim {
    fn default() -> Self {
        Self::unit()
    }
}

impl fmt::Display for CudaDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ScheduleOptions {
    pub fusion: FusionStrategy,
    pub allow_skewing: bool,
}

impl ScheduleOptions {
    pub const fn new(fusion: FusionStrategy, allow_skewing: bool) -> Self {
        Self {
            fusion,
            allow_skewing,
        }
    }
}

/// Every field takes part in equality and hashing, including the ones whose
/// value is only meaningful under a governing flag. Call [`normalized`] before
/// using options as a deduplication key.
///
/// [`normalized`]: MappingOptions::normalized
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MappingOptions {
    pub outer_schedule: ScheduleOptions,
    pub intra_tile_schedule: ScheduleOptions,
    pub tile: Vec<u64>,
    pub block: CudaDim,
    pub grid: CudaDim,
    pub tile_imperfectly_nested: bool,
    pub use_shared_memory: bool,
    pub use_private_memory: bool,
    pub use_read_only_cache: bool,
    pub unroll_copy_shared: bool,
    pub unroll: u64,
    pub shared_depth: u32,
    pub private_depth: u32,
    #[serde(default)]
    pub match_library_calls: bool,
}

impl MappingOptions {
    /// Conservative starting point used when nothing has been sampled.
    pub fn naive() -> Self {
        Self {
            outer_schedule: ScheduleOptions::new(FusionStrategy::Preserve3Coincident, false),
            intra_tile_schedule: ScheduleOptions::new(FusionStrategy::Preserve3Coincident, false),
            tile: vec![32, 32, 32],
            block: CudaDim::new(32, 8, 1),
            grid: CudaDim::new(256, 256, 1),
            tile_imperfectly_nested: false,
            use_shared_memory: false,
            use_private_memory: false,
            use_read_only_cache: false,
            unroll_copy_shared: false,
            unroll: 1,
            shared_depth: 0,
            private_depth: 0,
            match_library_calls: false,
        }
    }

    pub fn with_block(mut self, block: CudaDim) -> Self {
        self.block = block;
        self
    }

    pub fn with_grid(mut self, grid: CudaDim) -> Self {
        self.grid = grid;
        self
    }

    pub fn with_tile(mut self, tile: Vec<u64>) -> Self {
        self.tile = tile;
        self
    }

    /// Reset fields whose governing flag is off to their neutral value.
    pub fn normalized(mut self) -> Self {
        if !self.use_shared_memory {
            self.unroll_copy_shared = false;
            self.shared_depth = 0;
        }
        if !self.use_private_memory {
            self.private_depth = 0;
        }
        self
    }

    pub fn is_normalized(&self) -> bool {
        *self == self.clone().normalized()
    }

    /// Check hardware launch limits and basic well-formedness.
    pub fn validate(&self) -> Result<(), String> {
        let block = self.block;
        if block.x == 0 || block.y == 0 || block.z == 0 {
            return Err(format!("block dimensions must be > 0, got ({block})"));
        }
        if block.x > MAX_BLOCK_X || block.y > MAX_BLOCK_Y || block.z > MAX_BLOCK_Z {
            return Err(format!(
                "block ({block}) exceeds per-axis limits ({MAX_BLOCK_X},{MAX_BLOCK_Y},{MAX_BLOCK_Z})"
            ));
        }
        if block.product() > MAX_THREADS_PER_BLOCK {
            return Err(format!(
                "block ({block}) has {} threads, limit is {MAX_THREADS_PER_BLOCK}",
                block.product()
            ));
        }
        let grid = self.grid;
        if grid.x == 0 || grid.y == 0 || grid.z == 0 {
            return Err(format!("grid dimensions must be > 0, got ({grid})"));
        }
        if grid.x > MAX_GRID_X || grid.y > MAX_GRID_YZ || grid.z > MAX_GRID_YZ {
            return Err(format!("grid ({grid}) exceeds launch limits"));
        }
        if self.unroll == 0 {
            return Err("unroll factor must be >= 1".into());
        }
        if self.tile.is_empty() {
            return Err("at least one tile size is required".into());
        }
        Ok(())
    }
}

impl Default for MappingOptions {
    fn default() -> Self {
        Self::naive()
    }
}

impl fmt::Display for MappingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tiles = self
            .tile
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "outer({}, skew={}) intra({}, skew={}) tile[{}] block[{}] grid[{}] unroll={} imperfect={}",
            self.outer_schedule.fusion,
            self.outer_schedule.allow_skewing,
            self.intra_tile_schedule.fusion,
            self.intra_tile_schedule.allow_skewing,
            tiles,
            self.block,
            self.grid,
            self.unroll,
            self.tile_imperfectly_nested,
        )?;
        if self.use_shared_memory {
            write!(
                f,
                " shared(depth={}, unroll_copy={})",
                self.shared_depth, self.unroll_copy_shared
            )?;
        }
        if self.use_private_memory {
            write!(f, " private(depth={})", self.private_depth)?;
        }
        if self.use_read_only_cache {
            f.write_str(" read_only")?;
        }
        if self.match_library_calls {
            f.write_str(" library_calls")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naive_options_valid() {
        assert!(MappingOptions::naive().validate().is_ok());
        assert!(MappingOptions::naive().is_normalized());
    }

    #[test]
    fn test_invalid_launch_dims() {
        let options = MappingOptions::naive().with_block(CudaDim::new(32, 1, 65));
        assert!(options.validate().is_err());

        let options = MappingOptions::naive().with_block(CudaDim::new(64, 32, 1));
        assert!(options.validate().is_err());

        let options = MappingOptions::naive().with_grid(CudaDim::new(1, 1 << 16, 1));
        assert!(options.validate().is_err());

        let mut options = MappingOptions::naive();
        options.unroll = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_normalized_clears_conditional_fields() {
        let mut options = MappingOptions::naive();
        options.unroll_copy_shared = true;
        options.shared_depth = 4;
        options.private_depth = 7;
        assert!(!options.is_normalized());

        let normalized = options.normalized();
        assert!(!normalized.unroll_copy_shared);
        assert_eq!(normalized.shared_depth, 0);
        assert_eq!(normalized.private_depth, 0);
    }

    #[test]
    fn test_cuda_dim_defaults_missing_axes() {
        let dim: CudaDim = serde_json::from_str(r#"{"x": 56}"#).unwrap();
        assert_eq!(dim, CudaDim::new(56, 1, 1));
        assert_eq!(dim.product(), 56);
    }

    #[test]
    fn test_options_serialization() {
        let mut options = MappingOptions::naive();
        options.use_shared_memory = true;
        options.shared_depth = 3;
        let json = serde_json::to_string(&options).unwrap();
        let parsed: MappingOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(options, parsed);
        assert!(options.to_string().contains("shared(depth=3"));
    }
}
