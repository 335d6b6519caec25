//! Scoring strategy used by the record store.
//!
//! The store never counts or differentiates by itself; it calls into a
//! [`ScoringStrategy`]. [`StrategyKind`] picks one of the built-in
//! implementations from configuration, and [`StrategyFactory`] lets callers
//! hand in their own (tests use this to observe calls).

use crate::counter::{ThresholdCounter, count_scalar};
use crate::derivative::{ChangePointDetector, change_points_scalar};
use crate::error::RecordError;
use std::sync::Arc;

/// Capability set the store depends on
pub trait ScoringStrategy: Send {
    /// Counts, per monitored class, the detections scoring above `threshold`
    ///
    /// `out` has one slot per entry of `monitored`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Allocation`] if working memory cannot grow.
    fn count(
        &mut self,
        classes: &[u8],
        scores: &[u8],
        n: u32,
        monitored: &[i8],
        threshold: i8,
        out: &mut [u32],
    ) -> Result<(), RecordError>;

    /// Ascending indices `k` where `seq[k] != seq[k + 1]`
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Allocation`] if working memory cannot grow.
    fn change_points(&mut self, seq: &[i8]) -> Result<Vec<u32>, RecordError>;
}

/// Builds a fresh strategy for each store session
pub type StrategyFactory = Arc<dyn Fn() -> Box<dyn ScoringStrategy> + Send + Sync>;

/// Built-in strategies selectable from [`StoreOptions`](crate::StoreOptions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// 32-lane SIMD kernels with runtime CPU dispatch
    #[default]
    Vectorized,
    /// Plain iterator loops
    Scalar,
}

impl StrategyKind {
    /// Instantiates the strategy
    pub fn build(self) -> Box<dyn ScoringStrategy> {
        match self {
            StrategyKind::Vectorized => Box::new(VectorizedStrategy::default()),
            StrategyKind::Scalar => Box::new(ScalarStrategy),
        }
    }

    /// Wraps [`build`](Self::build) as a factory
    pub fn factory(self) -> StrategyFactory {
        Arc::new(move || self.build())
    }
}

/// SIMD counting and change-point detection with reusable scratch
#[derive(Default)]
pub struct VectorizedStrategy {
    counter: ThresholdCounter,
    detector: ChangePointDetector,
}

impl ScoringStrategy for VectorizedStrategy {
    fn count(
        &mut self,
        classes: &[u8],
        scores: &[u8],
        n: u32,
        monitored: &[i8],
        threshold: i8,
        out: &mut [u32],
    ) -> Result<(), RecordError> {
        self.counter.count(classes, scores, n, monitored, threshold, out)
    }

    fn change_points(&mut self, seq: &[i8]) -> Result<Vec<u32>, RecordError> {
        self.detector.change_points(seq)
    }
}

/// Allocation-free scalar reference
#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarStrategy;

impl ScoringStrategy for ScalarStrategy {
    fn count(
        &mut self,
        classes: &[u8],
        scores: &[u8],
        n: u32,
        monitored: &[i8],
        threshold: i8,
        out: &mut [u32],
    ) -> Result<(), RecordError> {
        for (slot, &class) in out.iter_mut().zip(monitored) {
            *slot = count_scalar(classes, scores, n, class, threshold);
        }
        Ok(())
    }

    fn change_points(&mut self, seq: &[i8]) -> Result<Vec<u32>, RecordError> {
        Ok(change_points_scalar(seq))
    }
}
