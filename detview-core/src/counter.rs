//! SIMD-accelerated per-class detection counting.
//!
//! For one example, counts the detections of each monitored class whose
//! score is strictly above a threshold. Class ids and scores are signed
//! bytes, so one 256-bit register holds a whole chunk of 32 detections.
//!
//! # Kernel
//!
//! Per chunk and per monitored class:
//! 1. Broadcast the class id and the threshold across all lanes
//! 2. `cmpeq(class_vec, classes)` and `cmpgt(scores, threshold_vec)` (signed)
//! 3. AND the two lane masks, movemask, popcount
//!
//! `n` is clamped to the shorter of the two arrays, so scratch is bounded by
//! the payload. Lanes past `n` in the last chunk are zero filled; a zero score
//! is never above a threshold in 0..=100, so padding never counts.

use crate::error::RecordError;

/// Lanes processed per vector step
pub const CHUNK_SIZE: usize = 32;

/// One 32-byte aligned chunk of lanes
#[derive(Clone, Copy, Default)]
#[repr(C, align(32))]
pub struct Lane(pub [i8; CHUNK_SIZE]);

/// Grows `scratch` to exactly `chunks` lanes, reporting allocation failure
pub(crate) fn resize_scratch(scratch: &mut Vec<Lane>, chunks: usize) -> Result<(), RecordError> {
    if chunks > scratch.len() {
        scratch.try_reserve_exact(chunks - scratch.len())?;
    }
    scratch.resize(chunks, Lane::default());
    Ok(())
}

/// Copies `src` into consecutive lanes and zeroes everything after it
pub(crate) fn fill_lanes(scratch: &mut [Lane], src: &[u8]) {
    let mut rest = src;
    for lane in scratch.iter_mut() {
        let take = rest.len().min(CHUNK_SIZE);
        let (head, tail) = rest.split_at(take);
        for (dst, &byte) in lane.0.iter_mut().zip(head) {
            *dst = byte as i8;
        }
        lane.0[take..].fill(0);
        rest = tail;
    }
}

/// Reusable counter with aligned scratch space
///
/// Scratch is reallocated only when the number of chunks changes between
/// calls, which for a typical file (fixed `num_detections` per image) means
/// exactly once per load.
#[derive(Default)]
pub struct ThresholdCounter {
    classes: Vec<Lane>,
    scores: Vec<Lane>,
}

impl ThresholdCounter {
    /// Creates a counter with empty scratch
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts detections above `threshold` for each class in `monitored`
    ///
    /// Only the first `min(n, classes.len(), scores.len())` detections are
    /// considered; a detection missing its class or its score never counts.
    /// `out` receives one count per monitored class, in order.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Allocation`] if scratch space cannot grow.
    pub fn count(
        &mut self,
        classes: &[u8],
        scores: &[u8],
        n: u32,
        monitored: &[i8],
        threshold: i8,
        out: &mut [u32],
    ) -> Result<(), RecordError> {
        debug_assert_eq!(monitored.len(), out.len());

        // A declared count beyond the bytes present never sizes the scratch
        let n = (n as usize).min(classes.len()).min(scores.len());
        let chunks = n.div_ceil(CHUNK_SIZE);
        if chunks != self.classes.len() {
            resize_scratch(&mut self.classes, chunks)?;
            resize_scratch(&mut self.scores, chunks)?;
        }
        fill_lanes(&mut self.classes, &classes[..n]);
        fill_lanes(&mut self.scores, &scores[..n]);

        for (slot, &class) in out.iter_mut().zip(monitored) {
            *slot = count_lanes(&self.classes, &self.scores, class, threshold);
        }
        Ok(())
    }
}

/// Counts lanes with `classes == class && scores > threshold`
///
/// # Architecture Dispatch
///
/// - x86_64 + AVX2: 32 lanes per step (runtime detection)
/// - aarch64: NEON, two 16-lane halves per step
/// - Fallback: portable scalar loop
#[inline]
pub fn count_lanes(classes: &[Lane], scores: &[Lane], class: i8, threshold: i8) -> u32 {
    debug_assert_eq!(classes.len(), scores.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return unsafe { count_lanes_avx2(classes, scores, class, threshold) };
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { count_lanes_neon(classes, scores, class, threshold) };
    }

    count_lanes_scalar(classes, scores, class, threshold)
}

/// Scalar implementation (portable fallback)
pub fn count_lanes_scalar(classes: &[Lane], scores: &[Lane], class: i8, threshold: i8) -> u32 {
    classes
        .iter()
        .zip(scores)
        .flat_map(|(c, s)| c.0.iter().zip(s.0.iter()))
        .filter(|&(&c, &s)| c == class && s > threshold)
        .count() as u32
}

/// Plain slice version used by the scalar strategy and as a test oracle
pub fn count_scalar(classes: &[u8], scores: &[u8], n: u32, class: i8, threshold: i8) -> u32 {
    classes
        .iter()
        .zip(scores)
        .take(n as usize)
        .filter(|&(&c, &s)| c as i8 == class && s as i8 > threshold)
        .count() as u32
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn count_lanes_avx2(classes: &[Lane], scores: &[Lane], class: i8, threshold: i8) -> u32 {
    use std::arch::x86_64::*;

    let class_vec = _mm256_set1_epi8(class);
    let threshold_vec = _mm256_set1_epi8(threshold);
    let mut total = 0u32;

    for (c, s) in classes.iter().zip(scores) {
        // Lane is 32-byte aligned, so aligned loads are valid
        let classes8 = unsafe { _mm256_load_si256(c.0.as_ptr().cast::<__m256i>()) };
        let scores8 = unsafe { _mm256_load_si256(s.0.as_ptr().cast::<__m256i>()) };

        let class_matches = _mm256_cmpeq_epi8(class_vec, classes8);
        let above_threshold = _mm256_cmpgt_epi8(scores8, threshold_vec);
        let valid = _mm256_and_si256(class_matches, above_threshold);

        total += (_mm256_movemask_epi8(valid) as u32).count_ones();
    }

    total
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn count_lanes_neon(classes: &[Lane], scores: &[Lane], class: i8, threshold: i8) -> u32 {
    use std::arch::aarch64::*;

    let class_vec = vdupq_n_s8(class);
    let threshold_vec = vdupq_n_s8(threshold);
    let mut total = 0u32;

    for (c, s) in classes.iter().zip(scores) {
        for half in 0..2 {
            let offset = half * 16;
            let classes8 = unsafe { vld1q_s8(c.0.as_ptr().add(offset)) };
            let scores8 = unsafe { vld1q_s8(s.0.as_ptr().add(offset)) };

            let valid = vandq_u8(vceqq_s8(classes8, class_vec), vcgtq_s8(scores8, threshold_vec));
            // Each matching lane is 0xFF; shift down to 1 and sum (max 16)
            total += u32::from(vaddvq_u8(vshrq_n_u8(valid, 7)));
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCORES: [i8; 9] = [80, 40, 80, 0, 20, 10, 5, 0, 60];
    const CLASSES: [i8; 9] = [2, 1, 2, 1, 1, 1, 2, 2, 2];

    fn bytes(values: &[i8]) -> Vec<u8> {
        values.iter().map(|&v| v as u8).collect()
    }

    #[test]
    fn test_reference_example() {
        let mut counter = ThresholdCounter::new();
        let mut out = [0u32; 2];
        counter
            .count(&bytes(&CLASSES), &bytes(&SCORES), 9, &[1, 2], 30, &mut out)
            .unwrap();
        assert_eq!(out, [1, 3]);
    }

    #[test]
    fn test_declared_count_larger_than_arrays() {
        // 200 declared detections, only 9 present
        let mut counter = ThresholdCounter::new();
        let mut out = [0u32; 2];
        counter
            .count(&bytes(&CLASSES), &bytes(&SCORES), 200, &[1, 2], 30, &mut out)
            .unwrap();
        assert_eq!(out, [1, 3]);
    }

    #[test]
    fn test_arrays_of_unequal_length() {
        // A score without a class must not read as class 0
        let mut counter = ThresholdCounter::new();
        let mut out = [0u32; 1];
        counter.count(&[], &[50], 1, &[0], 10, &mut out).unwrap();
        assert_eq!(out, [0]);

        counter.count(&[0, 0], &[50], 2, &[0], 10, &mut out).unwrap();
        assert_eq!(out, [1]);
    }

    #[test]
    fn test_huge_declared_count_stays_bounded() {
        let mut counter = ThresholdCounter::new();
        let mut out = [0u32; 1];
        counter.count(&[1], &[90], u32::MAX, &[1], 10, &mut out).unwrap();
        assert_eq!(out, [1]);
        assert_eq!(counter.classes.len(), 1);
        assert_eq!(counter.scores.len(), 1);
    }

    #[test]
    fn test_declared_count_smaller_than_arrays() {
        let mut counter = ThresholdCounter::new();
        let mut out = [0u32; 2];
        counter
            .count(&bytes(&CLASSES), &bytes(&SCORES), 3, &[1, 2], 30, &mut out)
            .unwrap();
        assert_eq!(out, [1, 2]);
    }

    #[test]
    fn test_padding_never_counts_for_class_zero() {
        let mut counter = ThresholdCounter::new();
        let mut out = [0u32; 1];
        counter.count(&[0], &[50], 1, &[0], 0, &mut out).unwrap();
        assert_eq!(out, [1]);
    }

    #[test]
    fn test_threshold_is_strict_and_signed() {
        let classes = bytes(&[1, 1, 1, 1]);
        let scores = bytes(&[30, 31, -100, 127]);
        let mut counter = ThresholdCounter::new();
        let mut out = [0u32; 1];
        counter.count(&classes, &scores, 4, &[1], 30, &mut out).unwrap();
        assert_eq!(out, [2]);
    }

    #[test]
    fn test_scratch_reuse_across_sizes() {
        let mut counter = ThresholdCounter::new();
        let mut out = [0u32; 1];
        for n in [64usize, 65, 3, 0, 64] {
            let classes = vec![7u8; n];
            let scores = vec![99u8; n];
            counter.count(&classes, &scores, n as u32, &[7], 50, &mut out).unwrap();
            assert_eq!(out[0] as usize, n, "n = {n}");
        }
    }

    #[test]
    fn test_dispatch_matches_scalar() {
        let classes: Vec<u8> = (0..100u8).map(|i| i % 5).collect();
        let scores: Vec<u8> = (0..100u8).map(|i| i.wrapping_mul(37) % 101).collect();

        let mut lanes_c = Vec::new();
        let mut lanes_s = Vec::new();
        resize_scratch(&mut lanes_c, 4).unwrap();
        resize_scratch(&mut lanes_s, 4).unwrap();
        fill_lanes(&mut lanes_c, &classes);
        fill_lanes(&mut lanes_s, &scores);

        for class in 0..5 {
            for threshold in [0i8, 10, 50, 99] {
                assert_eq!(
                    count_lanes(&lanes_c, &lanes_s, class, threshold),
                    count_lanes_scalar(&lanes_c, &lanes_s, class, threshold),
                );
                assert_eq!(
                    count_lanes_scalar(&lanes_c, &lanes_s, class, threshold),
                    count_scalar(&classes, &scores, 100, class, threshold),
                );
            }
        }
    }

    #[test]
    fn test_lane_alignment() {
        let lanes = vec![Lane::default(); 3];
        for lane in &lanes {
            assert_eq!(lane.0.as_ptr() as usize % 32, 0, "lanes must be 32-byte aligned");
        }
    }
}
