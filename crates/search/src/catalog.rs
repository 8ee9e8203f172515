//! Duplicate-free issuance of (shape, mapping options) pairs.
//!
//! The issuer owns a fixed set of distinct shape signatures drawn up front.
//! Each shape keeps the set of options currently reserved for it (in flight
//! or committed); a pair is never handed out twice unless it was released
//! first.

use crate::sampler::{OptionSampler, SamplerLimits};
use crate::shapes::{ShapeSampler, TileLayout};
use kernelvault_ir::{MappingOptions, ShapeSignature};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("shape sampler produced only {found} distinct signatures of {requested} requested within {draws} draws")]
    ShapeSpaceExhausted {
        requested: usize,
        found: usize,
        draws: usize,
    },
    #[error("invalid issuer configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuerConfig {
    pub shapes: usize,
    pub options_per_shape: usize,
    pub layout: TileLayout,
    pub min_blocks: u64,
    pub limits: SamplerLimits,
    pub seed: u64,
}

/// A pair handed to one worker. Hand it back through exactly one of
/// [`OptionIssuer::commit`], [`OptionIssuer::release`] or
/// [`OptionIssuer::discard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub shape_index: usize,
    pub signature: ShapeSignature,
    pub options: MappingOptions,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ShapeProgress {
    pub signature: String,
    pub reserved: usize,
    pub committed: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub fallbacks: u64,
    pub saturated: bool,
    pub retired: bool,
}

pub trait OptionIssuer: Send + Sync {
    /// Reserve a fresh pair. `None` means no shape can issue right now.
    fn reserve(&self) -> Option<Reservation>;
    /// Erase a pair that failed acceptance, freeing its slot.
    fn release(&self, reservation: &Reservation);
    /// Keep a pair that was accepted.
    fn commit(&self, reservation: &Reservation);
    /// Erase a pair whose compilation failed and never issue it again.
    fn discard(&self, reservation: &Reservation);
    /// Every shape has reached its quota or can no longer make progress.
    fn quota_met(&self) -> bool;
    /// Pairs reserved but not yet committed, released or discarded.
    fn pending(&self) -> usize;
    fn shape_count(&self) -> usize;
    fn options_per_shape(&self) -> usize;
    fn progress(&self) -> Vec<ShapeProgress>;

    fn target(&self) -> usize {
        self.shape_count().saturating_mul(self.options_per_shape())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ShapeSlot {
    signature: ShapeSignature,
    sampler: OptionSampler,
    reserved: HashSet<MappingOptions>,
    in_flight: HashSet<MappingOptions>,
    failed: HashSet<MappingOptions>,
    committed: usize,
    consecutive_failures: u32,
    saturated: bool,
    retired: bool,
}

impl ShapeSlot {
    fn new(signature: ShapeSignature, config: &IssuerConfig, seed: u64) -> Self {
        let sampler = OptionSampler::new(
            &signature,
            config.layout,
            config.min_blocks,
            config.limits,
            seed,
        );
        Self {
            signature,
            sampler,
            reserved: HashSet::new(),
            in_flight: HashSet::new(),
            failed: HashSet::new(),
            committed: 0,
            consecutive_failures: 0,
            saturated: false,
            retired: false,
        }
    }

    /// A saturated shape may still have pairs in flight; releasing any of
    /// them reopens it.
    fn done(&self, quota: usize) -> bool {
        self.committed >= quota || self.retired || (self.saturated && self.in_flight.is_empty())
    }

    fn try_issue(&mut self, quota: usize, max_collisions: u32) -> Option<MappingOptions> {
        if self.saturated || self.retired || self.reserved.len() >= quota {
            return None;
        }
        for _ in 0..=max_collisions {
            let options = self.sampler.sample();
            if self.reserved.contains(&options) || self.failed.contains(&options) {
                continue;
            }
            self.reserved.insert(options.clone());
            self.in_flight.insert(options.clone());
            return Some(options);
        }
        self.saturated = true;
        warn!(
            shape = %self.signature,
            reserved = self.reserved.len(),
            "option space saturated, skipping shape"
        );
        None
    }

    fn release(&mut self, options: &MappingOptions) {
        if self.in_flight.remove(options) {
            self.reserved.remove(options);
            self.saturated = false;
        }
    }

    fn commit(&mut self, options: &MappingOptions) {
        if self.in_flight.remove(options) {
            self.committed += 1;
            self.consecutive_failures = 0;
        }
    }

    fn discard(&mut self, options: &MappingOptions, max_failures: u32) {
        if !self.in_flight.remove(options) {
            return;
        }
        self.reserved.remove(options);
        self.failed.insert(options.clone());
        self.consecutive_failures += 1;
        if self.consecutive_failures >= max_failures && !self.retired {
            self.retired = true;
            warn!(
                shape = %self.signature,
                failures = self.consecutive_failures,
                "retiring shape after repeated compile failures"
            );
        }
    }

    fn progress(&self) -> ShapeProgress {
        ShapeProgress {
            signature: self.signature.to_string(),
            reserved: self.reserved.len(),
            committed: self.committed,
            in_flight: self.in_flight.len(),
            failed: self.failed.len(),
            fallbacks: self.sampler.fallbacks(),
            saturated: self.saturated,
            retired: self.retired,
        }
    }
}

fn build_slots(
    shapes: &mut dyn ShapeSampler,
    config: &IssuerConfig,
) -> Result<Vec<ShapeSlot>, SearchError> {
    if config.shapes == 0 || config.options_per_shape == 0 {
        return Err(SearchError::InvalidConfig(
            "shapes and options per shape must be positive".into(),
        ));
    }
    config.limits.validate().map_err(SearchError::InvalidConfig)?;

    let budget = config
        .shapes
        .saturating_mul(config.limits.shape_draws_per_shape);
    let mut seen = HashSet::new();
    let mut ordered = Vec::with_capacity(config.shapes);
    let mut draws = 0;
    while ordered.len() < config.shapes {
        if draws >= budget {
            return Err(SearchError::ShapeSpaceExhausted {
                requested: config.shapes,
                found: ordered.len(),
                draws,
            });
        }
        draws += 1;
        let signature = shapes.sample();
        if seen.insert(signature.clone()) {
            ordered.push(signature);
        }
    }
    debug!(shapes = ordered.len(), draws, "drew distinct shape signatures");

    let mut master = fastrand::Rng::with_seed(config.seed);
    Ok(ordered
        .into_iter()
        .map(|signature| {
            let seed = master.u64(..);
            ShapeSlot::new(signature, config, seed)
        })
        .collect())
}

/// Issuer guarded by a single mutex.
///
/// Shapes are scanned in construction order, so a single worker with a
/// fixed seed sees a reproducible sequence of pairs.
pub struct ShapeOptionCatalog {
    slots: Mutex<Vec<ShapeSlot>>,
    options_per_shape: usize,
    limits: SamplerLimits,
}

impl ShapeOptionCatalog {
    pub fn build(
        shapes: &mut dyn ShapeSampler,
        config: IssuerConfig,
    ) -> Result<Self, SearchError> {
        let slots = build_slots(shapes, &config)?;
        Ok(Self {
            slots: Mutex::new(slots),
            options_per_shape: config.options_per_shape,
            limits: config.limits,
        })
    }

    pub fn signatures(&self) -> Vec<ShapeSignature> {
        lock(&self.slots)
            .iter()
            .map(|slot| slot.signature.clone())
            .collect()
    }
}

impl OptionIssuer for ShapeOptionCatalog {
    fn reserve(&self) -> Option<Reservation> {
        let mut slots = lock(&self.slots);
        for (shape_index, slot) in slots.iter_mut().enumerate() {
            if let Some(options) = slot.try_issue(self.options_per_shape, self.limits.max_collisions)
            {
                return Some(Reservation {
                    shape_index,
                    signature: slot.signature.clone(),
                    options,
                });
            }
        }
        None
    }

    fn release(&self, reservation: &Reservation) {
        if let Some(slot) = lock(&self.slots).get_mut(reservation.shape_index) {
            slot.release(&reservation.options);
        }
    }

    fn commit(&self, reservation: &Reservation) {
        if let Some(slot) = lock(&self.slots).get_mut(reservation.shape_index) {
            slot.commit(&reservation.options);
        }
    }

    fn discard(&self, reservation: &Reservation) {
        if let Some(slot) = lock(&self.slots).get_mut(reservation.shape_index) {
            slot.discard(&reservation.options, self.limits.max_consecutive_failures);
        }
    }

    fn quota_met(&self) -> bool {
        lock(&self.slots)
            .iter()
            .all(|slot| slot.done(self.options_per_shape))
    }

    fn pending(&self) -> usize {
        lock(&self.slots)
            .iter()
            .map(|slot| slot.in_flight.len())
            .sum()
    }

    fn shape_count(&self) -> usize {
        lock(&self.slots).len()
    }

    fn options_per_shape(&self) -> usize {
        self.options_per_shape
    }

    fn progress(&self) -> Vec<ShapeProgress> {
        lock(&self.slots).iter().map(ShapeSlot::progress).collect()
    }
}

/// Issuer with one mutex per shape. A caller holds at most one shape lock at
/// a time, and each scan starts at a rotating cursor so concurrent workers
/// spread across shapes.
pub struct StripedShapeOptionCatalog {
    slots: Vec<Mutex<ShapeSlot>>,
    cursor: AtomicUsize,
    options_per_shape: usize,
    limits: SamplerLimits,
}

impl StripedShapeOptionCatalog {
    pub fn build(
        shapes: &mut dyn ShapeSampler,
        config: IssuerConfig,
    ) -> Result<Self, SearchError> {
        let slots = build_slots(shapes, &config)?
            .into_iter()
            .map(Mutex::new)
            .collect();
        Ok(Self {
            slots,
            cursor: AtomicUsize::new(0),
            options_per_shape: config.options_per_shape,
            limits: config.limits,
        })
    }

    pub fn signatures(&self) -> Vec<ShapeSignature> {
        self.slots
            .iter()
            .map(|slot| lock(slot).signature.clone())
            .collect()
    }
}

impl OptionIssuer for StripedShapeOptionCatalog {
    fn reserve(&self) -> Option<Reservation> {
        let count = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count.max(1);
        for offset in 0..count {
            let shape_index = (start + offset) % count;
            let mut slot = lock(&self.slots[shape_index]);
            if let Some(options) = slot.try_issue(self.options_per_shape, self.limits.max_collisions)
            {
                return Some(Reservation {
                    shape_index,
                    signature: slot.signature.clone(),
                    options,
                });
            }
        }
        None
    }

    fn release(&self, reservation: &Reservation) {
        if let Some(slot) = self.slots.get(reservation.shape_index) {
            lock(slot).release(&reservation.options);
        }
    }

    fn commit(&self, reservation: &Reservation) {
        if let Some(slot) = self.slots.get(reservation.shape_index) {
            lock(slot).commit(&reservation.options);
        }
    }

    fn discard(&self, reservation: &Reservation) {
        if let Some(slot) = self.slots.get(reservation.shape_index) {
            lock(slot).discard(&reservation.options, self.limits.max_consecutive_failures);
        }
    }

    fn quota_met(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| lock(slot).done(self.options_per_shape))
    }

    fn pending(&self) -> usize {
        self.slots.iter().map(|slot| lock(slot).in_flight.len()).sum()
    }

    fn shape_count(&self) -> usize {
        self.slots.len()
    }

    fn options_per_shape(&self) -> usize {
        self.options_per_shape
    }

    fn progress(&self) -> Vec<ShapeProgress> {
        self.slots.iter().map(|slot| lock(slot).progress()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{FixedShapes, ShapeRanges, WorkloadFamily};
    use kernelvault_ir::TensorDescriptor;
    use std::sync::Arc;
    use std::thread;

    fn config(shapes: usize, options_per_shape: usize) -> IssuerConfig {
        IssuerConfig {
            shapes,
            options_per_shape,
            layout: TileLayout::new(3, 1),
            min_blocks: 56,
            limits: SamplerLimits::default(),
            seed: 17,
        }
    }

    fn mlp3_shapes() -> Box<dyn ShapeSampler> {
        WorkloadFamily::Mlp3.sampler(&ShapeRanges::default(), 5)
    }

    #[test]
    fn test_distinct_shapes_and_quota() {
        let catalog = ShapeOptionCatalog::build(mlp3_shapes().as_mut(), config(2, 3)).unwrap();
        let signatures = catalog.signatures();
        assert_eq!(signatures.len(), 2);
        assert_ne!(signatures[0], signatures[1]);

        let mut issued = Vec::new();
        while let Some(reservation) = catalog.reserve() {
            issued.push(reservation);
        }
        assert_eq!(issued.len(), 6);
        assert_eq!(catalog.pending(), 6);
        let unique: HashSet<_> = issued
            .iter()
            .map(|r| (r.shape_index, r.options.clone()))
            .collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn test_release_frees_slot_and_commit_counts() {
        let catalog = ShapeOptionCatalog::build(mlp3_shapes().as_mut(), config(1, 2)).unwrap();
        let a = catalog.reserve().unwrap();
        let b = catalog.reserve().unwrap();
        assert!(catalog.reserve().is_none());

        catalog.release(&a);
        catalog.release(&a);
        assert_eq!(catalog.pending(), 1);
        let c = catalog.reserve().unwrap();
        assert_ne!(c.options, b.options);

        catalog.commit(&b);
        catalog.commit(&c);
        assert!(catalog.quota_met());
        assert_eq!(catalog.pending(), 0);
        assert_eq!(catalog.progress()[0].committed, 2);
    }

    #[test]
    fn test_repeated_failures_retire_shape() {
        let mut cfg = config(1, 100);
        cfg.limits.max_consecutive_failures = 3;
        let catalog = ShapeOptionCatalog::build(mlp3_shapes().as_mut(), cfg).unwrap();
        for _ in 0..3 {
            let r = catalog.reserve().unwrap();
            catalog.discard(&r);
        }
        assert!(catalog.reserve().is_none());
        assert!(catalog.quota_met());
        let progress = catalog.progress();
        assert!(progress[0].retired);
        assert_eq!(progress[0].failed, 3);
    }

    #[test]
    fn test_tiny_space_saturates() {
        let catalog = tiny_space_catalog(50);
        let mut issued = 0;
        while catalog.reserve().is_some() {
            issued += 1;
        }
        assert!(issued > 0);
        assert!(catalog.progress()[0].saturated);
    }

    /// Max dimension 1 leaves only fusion and boolean choices to vary.
    fn tiny_space_catalog(max_collisions: u32) -> ShapeOptionCatalog {
        let sig = ShapeSignature::new(vec![TensorDescriptor::float32(&[1])]);
        let mut shapes = FixedShapes::new(vec![sig]);
        let mut cfg = config(1, 100_000);
        cfg.layout = TileLayout::new(1, 1);
        cfg.limits.max_attempts = 1;
        cfg.limits.max_collisions = max_collisions;
        ShapeOptionCatalog::build(&mut shapes, cfg).unwrap()
    }

    #[test]
    fn test_release_reopens_saturated_shape() {
        let catalog = tiny_space_catalog(0);
        let mut held = Vec::new();
        while let Some(r) = catalog.reserve() {
            held.push(r);
        }
        assert!(!held.is_empty());
        assert!(catalog.progress()[0].saturated);
        // Nothing committed and pairs still in flight: not finished.
        assert!(!catalog.quota_met());

        for r in &held {
            catalog.release(r);
        }
        let progress = catalog.progress();
        assert!(!progress[0].saturated);
        assert_eq!(progress[0].reserved, 0);
        assert!(!catalog.quota_met());
        assert!(catalog.reserve().is_some());
    }

    #[test]
    fn test_released_pairs_are_issued_again() {
        let catalog = tiny_space_catalog(1000);
        let mut first = Vec::new();
        while let Some(r) = catalog.reserve() {
            first.push(r);
        }
        for r in &first {
            catalog.release(r);
        }
        let first: HashSet<_> = first.into_iter().map(|r| r.options).collect();

        let mut again = HashSet::new();
        while let Some(r) = catalog.reserve() {
            again.insert(r.options);
        }
        assert!(again.iter().any(|options| first.contains(options)));
    }

    #[test]
    fn test_too_few_distinct_shapes_is_an_error() {
        let sig = ShapeSignature::new(vec![TensorDescriptor::float32(&[4])]);
        let mut shapes = FixedShapes::new(vec![sig]);
        let mut cfg = config(2, 1);
        cfg.limits.shape_draws_per_shape = 5;
        let err = ShapeOptionCatalog::build(&mut shapes, cfg)
            .err()
            .unwrap();
        assert_eq!(
            err,
            SearchError::ShapeSpaceExhausted {
                requested: 2,
                found: 1,
                draws: 10
            }
        );
    }

    #[test]
    fn test_same_seed_same_issuance() {
        let a = ShapeOptionCatalog::build(mlp3_shapes().as_mut(), config(2, 4)).unwrap();
        let b = ShapeOptionCatalog::build(mlp3_shapes().as_mut(), config(2, 4)).unwrap();
        for _ in 0..8 {
            assert_eq!(a.reserve(), b.reserve());
        }
    }

    #[test]
    fn test_striped_concurrent_reservations_are_unique() {
        let catalog = Arc::new(
            StripedShapeOptionCatalog::build(mlp3_shapes().as_mut(), config(4, 25)).unwrap(),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(r) = catalog.reserve() {
                        catalog.commit(&r);
                        mine.push((r.shape_index, r.options));
                    }
                    mine
                })
            })
            .collect();
        let all: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 100);
        let unique: HashSet<_> = all.into_iter().collect();
        assert_eq!(unique.len(), 100);
        assert!(catalog.quota_met());
        assert_eq!(catalog.target(), 100);
    }
}
