//! Workload families and their input-shape samplers.

use kernelvault_ir::{library, ShapeSignature, TensorDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Produces input-shape signatures for one workload family.
pub trait ShapeSampler: Send {
    fn sample(&mut self) -> ShapeSignature;
}

/// Inclusive integer range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntRange {
    pub low: u64,
    pub high: u64,
}

impl IntRange {
    pub const fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    pub fn draw(&self, rng: &mut fastrand::Rng) -> u64 {
        if self.high <= self.low {
            self.low
        } else {
            rng.u64(self.low..=self.high)
        }
    }

    /// `2^k` for `k` drawn from this range.
    pub fn draw_pow2(&self, rng: &mut fastrand::Rng) -> u64 {
        1u64 << self.draw(rng).min(62)
    }

    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.low > self.high {
            return Err(format!("{name}: low {} exceeds high {}", self.low, self.high));
        }
        Ok(())
    }
}

/// Number of schedule dimensions to tile, and how many leading ones are
/// pinned to a tile size of 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TileLayout {
    pub dims: usize,
    pub fixed: usize,
}

impl TileLayout {
    pub const fn new(dims: usize, fixed: usize) -> Self {
        Self { dims, fixed }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConvolutionRanges {
    pub kernel_hw: IntRange,
    pub image_hw: IntRange,
    pub channels: IntRange,
}

impl Default for GroupConvolutionRanges {
    fn default() -> Self {
        Self {
            kernel_hw: IntRange::new(1, 9),
            image_hw: IntRange::new(8, 64),
            channels: IntRange::new(4, 32),
        }
    }
}

/// Batch, channel and group counts are powers of two; the ranges hold
/// exponents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupNormalizationRanges {
    pub batch_log2: IntRange,
    pub channels_log2: IntRange,
    pub groups_log2: IntRange,
    pub height: IntRange,
    pub width: IntRange,
}

impl Default for GroupNormalizationRanges {
    fn default() -> Self {
        Self {
            batch_log2: IntRange::new(1, 5),
            channels_log2: IntRange::new(2, 10),
            groups_log2: IntRange::new(0, 5),
            height: IntRange::new(16, 48),
            width: IntRange::new(16, 48),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mlp3Ranges {
    pub batch: IntRange,
    pub n: IntRange,
    pub o: IntRange,
    pub p: IntRange,
    pub q: IntRange,
}

impl Default for Mlp3Ranges {
    fn default() -> Self {
        Self {
            batch: IntRange::new(1, 128),
            n: IntRange::new(32, 1024),
            o: IntRange::new(32, 256),
            p: IntRange::new(32, 128),
            q: IntRange::new(2, 32),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaveNetRanges {
    pub batch: IntRange,
    pub residual_channels: IntRange,
    pub dilation_channels: IntRange,
    pub skip_channels: IntRange,
    pub receptive_field: u64,
    pub dilation_factor_log2: IntRange,
}

impl Default for WaveNetRanges {
    fn default() -> Self {
        Self {
            batch: IntRange::new(1, 32),
            residual_channels: IntRange::new(1, 64),
            dilation_channels: IntRange::new(1, 64),
            skip_channels: IntRange::new(1, 64),
            receptive_field: 4000,
            dilation_factor_log2: IntRange::new(0, 9),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShapeRanges {
    pub group_convolution: GroupConvolutionRanges,
    pub group_normalization: GroupNormalizationRanges,
    pub mlp3: Mlp3Ranges,
    pub wavenet: WaveNetRanges,
}

impl ShapeRanges {
    pub fn validate(&self) -> Result<(), String> {
        let gc = &self.group_convolution;
        gc.kernel_hw.validate("group_convolution.kernel_hw")?;
        gc.image_hw.validate("group_convolution.image_hw")?;
        gc.channels.validate("group_convolution.channels")?;
        if gc.kernel_hw.low == 0 || gc.image_hw.low == 0 || gc.channels.low == 0 {
            return Err("group_convolution ranges must start at 1 or more".into());
        }

        let gn = &self.group_normalization;
        gn.batch_log2.validate("group_normalization.batch_log2")?;
        gn.channels_log2.validate("group_normalization.channels_log2")?;
        gn.groups_log2.validate("group_normalization.groups_log2")?;
        gn.height.validate("group_normalization.height")?;
        gn.width.validate("group_normalization.width")?;
        if gn.height.low == 0 || gn.width.low == 0 {
            return Err("group_normalization height and width must start at 1 or more".into());
        }

        let mlp = &self.mlp3;
        for (name, range) in [
            ("mlp3.batch", mlp.batch),
            ("mlp3.n", mlp.n),
            ("mlp3.o", mlp.o),
            ("mlp3.p", mlp.p),
            ("mlp3.q", mlp.q),
        ] {
            range.validate(name)?;
            if range.low == 0 {
                return Err(format!("{name} must start at 1 or more"));
            }
        }

        let wn = &self.wavenet;
        for (name, range) in [
            ("wavenet.batch", wn.batch),
            ("wavenet.residual_channels", wn.residual_channels),
            ("wavenet.dilation_channels", wn.dilation_channels),
            ("wavenet.skip_channels", wn.skip_channels),
        ] {
            range.validate(name)?;
            if range.low == 0 {
                return Err(format!("{name} must start at 1 or more"));
            }
        }
        wn.dilation_factor_log2
            .validate("wavenet.dilation_factor_log2")?;
        if wn.receptive_field == 0 {
            return Err("wavenet.receptive_field must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadFamily {
    GroupConvolution,
    GroupNormalization,
    Mlp3,
    #[serde(rename = "wavenet")]
    WaveNet,
}

impl WorkloadFamily {
    pub const ALL: [WorkloadFamily; 4] = [
        WorkloadFamily::GroupConvolution,
        WorkloadFamily::GroupNormalization,
        WorkloadFamily::Mlp3,
        WorkloadFamily::WaveNet,
    ];

    pub fn program(&self) -> &'static str {
        match self {
            WorkloadFamily::GroupConvolution => library::GROUP_CONVOLUTION,
            WorkloadFamily::GroupNormalization => library::GROUP_NORMALIZATION,
            WorkloadFamily::Mlp3 => library::MLP3,
            WorkloadFamily::WaveNet => library::WAVENET,
        }
    }

    pub fn entry_point(&self) -> &'static str {
        match self {
            WorkloadFamily::GroupConvolution => "group_convolution",
            WorkloadFamily::GroupNormalization => "group_normalization_single_kernel",
            WorkloadFamily::Mlp3 => "mlp3",
            WorkloadFamily::WaveNet => "wavenet1",
        }
    }

    pub fn tile_layout(&self) -> TileLayout {
        match self {
            WorkloadFamily::GroupConvolution => TileLayout::new(3, 2),
            WorkloadFamily::GroupNormalization => TileLayout::new(1, 1),
            WorkloadFamily::Mlp3 | WorkloadFamily::WaveNet => TileLayout::new(3, 1),
        }
    }

    /// Blocks-per-grid floor for the device each family was tuned against.
    pub fn default_min_blocks(&self) -> u64 {
        match self {
            WorkloadFamily::GroupConvolution => 20,
            _ => 56,
        }
    }

    pub fn sampler(&self, ranges: &ShapeRanges, seed: u64) -> Box<dyn ShapeSampler> {
        let rng = fastrand::Rng::with_seed(seed);
        match self {
            WorkloadFamily::GroupConvolution => Box::new(GroupConvolutionSampler {
                ranges: ranges.group_convolution,
                rng,
            }),
            WorkloadFamily::GroupNormalization => Box::new(GroupNormalizationSampler {
                ranges: ranges.group_normalization,
                rng,
            }),
            WorkloadFamily::Mlp3 => Box::new(Mlp3Sampler {
                ranges: ranges.mlp3,
                rng,
            }),
            WorkloadFamily::WaveNet => Box::new(WaveNetSampler {
                ranges: ranges.wavenet,
                rng,
            }),
        }
    }
}

impl fmt::Display for WorkloadFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkloadFamily::GroupConvolution => "group-convolution",
            WorkloadFamily::GroupNormalization => "group-normalization",
            WorkloadFamily::Mlp3 => "mlp3",
            WorkloadFamily::WaveNet => "wavenet",
        };
        f.write_str(name)
    }
}

fn signature(shapes: &[&[u64]]) -> ShapeSignature {
    ShapeSignature::new(
        shapes
            .iter()
            .map(|shape| TensorDescriptor::float32(shape))
            .collect(),
    )
}

pub struct GroupConvolutionSampler {
    ranges: GroupConvolutionRanges,
    rng: fastrand::Rng,
}

impl ShapeSampler for GroupConvolutionSampler {
    fn sample(&mut self) -> ShapeSignature {
        let khw = self.ranges.kernel_hw.draw(&mut self.rng);
        let hw = self.ranges.image_hw.draw(&mut self.rng);
        let cf = self.ranges.channels.draw(&mut self.rng);
        signature(&[&[32, 32, cf, hw, hw], &[32, cf, cf, khw, khw], &[32, cf]])
    }
}

pub struct GroupNormalizationSampler {
    ranges: GroupNormalizationRanges,
    rng: fastrand::Rng,
}

impl ShapeSampler for GroupNormalizationSampler {
    fn sample(&mut self) -> ShapeSignature {
        let h = self.ranges.height.draw(&mut self.rng);
        let w = self.ranges.width.draw(&mut self.rng);
        let n = self.ranges.batch_log2.draw_pow2(&mut self.rng);
        let c = self.ranges.channels_log2.draw_pow2(&mut self.rng);
        // More groups than channels would leave D = 0.
        let g = self.ranges.groups_log2.draw_pow2(&mut self.rng).min(c);
        let d = c / g;
        signature(&[&[n, g, d, h, w], &[g, d], &[g, d]])
    }
}

pub struct Mlp3Sampler {
    ranges: Mlp3Ranges,
    rng: fastrand::Rng,
}

impl ShapeSampler for Mlp3Sampler {
    fn sample(&mut self) -> ShapeSignature {
        let b = self.ranges.batch.draw(&mut self.rng);
        let n = self.ranges.n.draw(&mut self.rng);
        let o = self.ranges.o.draw(&mut self.rng);
        let p = self.ranges.p.draw(&mut self.rng);
        let q = self.ranges.q.draw(&mut self.rng);
        signature(&[&[b, n], &[o, n], &[o], &[p, o], &[p], &[q, p], &[q]])
    }
}

pub struct WaveNetSampler {
    ranges: WaveNetRanges,
    rng: fastrand::Rng,
}

impl ShapeSampler for WaveNetSampler {
    fn sample(&mut self) -> ShapeSignature {
        let b = self.ranges.batch.draw(&mut self.rng);
        let residual = self.ranges.residual_channels.draw(&mut self.rng);
        let dilation = self.ranges.dilation_channels.draw(&mut self.rng);
        let skip = self.ranges.skip_channels.draw(&mut self.rng);
        let factor = self.ranges.dilation_factor_log2.draw_pow2(&mut self.rng);
        let rf = self.ranges.receptive_field;
        signature(&[
            &[b, residual, rf],
            &[dilation, residual, 2],
            &[dilation],
            &[dilation, residual, 2],
            &[dilation],
            &[residual, dilation],
            &[residual],
            &[skip, dilation],
            &[skip],
            &[factor],
        ])
    }
}

/// Replays a fixed list of signatures in order, cycling when exhausted.
pub struct FixedShapes {
    shapes: Vec<ShapeSignature>,
    next: usize,
}

impl FixedShapes {
    pub fn new(shapes: Vec<ShapeSignature>) -> Self {
        Self { shapes, next: 0 }
    }
}

impl ShapeSampler for FixedShapes {
    fn sample(&mut self) -> ShapeSignature {
        if self.shapes.is_empty() {
            return ShapeSignature::new(Vec::new());
        }
        let shape = self.shapes[self.next % self.shapes.len()].clone();
        self.next += 1;
        shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelvault_ir::parse;

    fn bind_ok(program: &str, entry: &str, sig: &ShapeSignature) -> bool {
        let program = parse(program).unwrap();
        program
            .definition(entry)
            .unwrap()
            .bind_sizes(sig.descriptors())
            .is_ok()
    }

    #[test]
    fn test_samples_bind_to_their_programs() {
        let ranges = ShapeRanges::default();
        for family in WorkloadFamily::ALL {
            let mut sampler = family.sampler(&ranges, 7);
            for _ in 0..50 {
                let sig = sampler.sample();
                assert!(
                    bind_ok(family.program(), family.entry_point(), &sig),
                    "{family}: {sig}"
                );
            }
        }
    }

    #[test]
    fn test_group_normalization_never_divides_to_zero() {
        let ranges = ShapeRanges {
            group_normalization: GroupNormalizationRanges {
                channels_log2: IntRange::new(0, 1),
                groups_log2: IntRange::new(3, 5),
                ..GroupNormalizationRanges::default()
            },
            ..ShapeRanges::default()
        };
        let mut sampler = WorkloadFamily::GroupNormalization.sampler(&ranges, 3);
        for _ in 0..100 {
            let sig = sampler.sample();
            assert!(sig.descriptors()[1].shape.iter().all(|&dim| dim > 0));
        }
    }

    #[test]
    fn test_wavenet_dilation_factor_varies() {
        let mut sampler = WorkloadFamily::WaveNet.sampler(&ShapeRanges::default(), 11);
        let factors: std::collections::HashSet<u64> = (0..200)
            .map(|_| sampler.sample().descriptors()[9].shape[0])
            .collect();
        assert!(factors.len() > 1);
        assert!(factors.iter().all(|f| f.is_power_of_two() && *f <= 512));
    }

    #[test]
    fn test_seeded_samplers_repeat() {
        let ranges = ShapeRanges::default();
        let mut a = WorkloadFamily::Mlp3.sampler(&ranges, 42);
        let mut b = WorkloadFamily::Mlp3.sampler(&ranges, 42);
        for _ in 0..10 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    #[test]
    fn test_family_serde_names() {
        let json = serde_json::to_string(&WorkloadFamily::WaveNet).unwrap();
        assert_eq!(json, "\"wavenet\"");
        let family: WorkloadFamily = serde_json::from_str("\"group-convolution\"").unwrap();
        assert_eq!(family, WorkloadFamily::GroupConvolution);
        assert!(ShapeRanges::default().validate().is_ok());
    }
}
