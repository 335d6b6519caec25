//! detview - record store and vectorized analytics for detection viewers
//!
//! detview backs an image viewer for object-detection results. It streams a
//! file of length-prefixed `Example` records, keeps a sparse offset index for
//! random access, counts per-record detections of a few monitored classes
//! with SIMD kernels, and derives the records where those counts change.
//!
//! # Features
//!
//! - Streaming load: the record file is never read into memory as a whole
//! - Sparse offset index (one entry per 1024 records) for random access
//! - 32-lane AVX2/NEON threshold counting and change-point detection
//! - Single-loader, multi-reader concurrency with lock-free appends
//! - Explicit completion signal for background loads
//!
//! # Example
//!
//! ```no_run
//! use detview_core::{RecordStore, StoreOptions};
//!
//! # fn main() -> anyhow::Result<()> {
//! let options = StoreOptions { monitored_classes: vec![1, 2], score_threshold: 30, ..Default::default() };
//! let store = RecordStore::new(options)?;
//!
//! store.open("detections.bin")?;
//! let report = store.load();
//! println!("{report:?}");
//!
//! // Per-record counts of the first monitored class
//! let counts = store.num_detections(0);
//!
//! // Jump to the next record where any count changes
//! let next = store.next_poi(0);
//! if next < store.num_records() {
//!     println!("{} -> {}", counts[next as usize], store.item_path(next)?.display());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Scope
//!
//! Rendering, annotation persistence and classifier logic live in the
//! application. detview is the data layer underneath.

pub mod buffer;
pub mod counter;
pub mod derivative;
mod error;
pub mod record;
mod store;
pub mod strategy;

pub use buffer::{Appender, GrowableBuffer};
pub use counter::ThresholdCounter;
pub use derivative::ChangePointDetector;
pub use error::RecordError;
pub use record::{Example, HEADER_SIZE, RecordReader, RecordWriter, Size};
pub use store::{LoadReport, LoadState, LoadStop, RecordStore, StoreState};
pub use strategy::{ScoringStrategy, StrategyFactory, StrategyKind};

use anyhow::Result;

/// Highest accepted score threshold
pub const MAX_SCORE_THRESHOLD: i8 = 100;

/// Configuration options for RecordStore
///
/// Fixed for the lifetime of the store; every session opened by it uses the
/// same classes and threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Class ids whose detections are counted, in output order
    pub monitored_classes: Vec<i8>,

    /// Detections count only if their score is strictly above this (0..=100)
    pub score_threshold: i8,

    /// Largest accepted payload; bigger records stop the load
    pub max_record_size: usize,

    /// Distance, in records, between offset index entries
    pub index_stride: u32,

    /// Growth granularity of the per-class count buffers
    pub buffer_chunk: usize,

    /// Counting / derivative implementation
    pub strategy: StrategyKind,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            monitored_classes: vec![1, 2],
            score_threshold: 10,
            max_record_size: 10_000,
            index_stride: 1024,
            buffer_chunk: buffer::DEFAULT_CHUNK,
            strategy: StrategyKind::default(),
        }
    }
}

impl StoreOptions {
    /// Checks the options for consistency
    ///
    /// # Errors
    ///
    /// Returns an error if no class is monitored, the threshold is outside
    /// 0..=100, or a size parameter is zero.
    pub fn validate(&self) -> Result<()> {
        if self.monitored_classes.is_empty() {
            anyhow::bail!("At least one monitored class is required");
        }
        if !(0..=MAX_SCORE_THRESHOLD).contains(&self.score_threshold) {
            anyhow::bail!(
                "Score threshold must be within 0..={}, got {}",
                MAX_SCORE_THRESHOLD,
                self.score_threshold
            );
        }
        if self.max_record_size == 0 || self.index_stride == 0 || self.buffer_chunk == 0 {
            anyhow::bail!("max_record_size, index_stride and buffer_chunk must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = StoreOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.monitored_classes, vec![1, 2]);
        assert_eq!(options.index_stride, 1024);
        assert_eq!(options.buffer_chunk, 512);
    }

    #[test]
    fn test_threshold_out_of_range() {
        let options = StoreOptions { score_threshold: 101, ..Default::default() };
        let err = RecordStore::new(options).unwrap_err();
        assert!(err.to_string().contains("threshold"));

        let options = StoreOptions { score_threshold: -1, ..Default::default() };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_no_monitored_classes() {
        let options = StoreOptions { monitored_classes: Vec::new(), ..Default::default() };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_zero_stride_rejected() {
        let options = StoreOptions { index_stride: 0, ..Default::default() };
        assert!(options.validate().is_err());
    }
}
