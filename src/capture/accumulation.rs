//! Temporal accumulation (motion blur).
//!
//! With accumulation on, the renderer runs `oversample` times faster than the
//! output frame rate. Every rendered frame is folded into a ring of the last
//! `blend_frames` frames and only every `oversample`-th frame is captured, as
//! a weighted blend of the ring.

/// Upper bound on the blend ring size.
pub const MAX_BLEND_FRAMES: u32 = 64;

/// Normalized Gaussian weights for `count` frames, oldest first.
///
/// The curve is centered on the middle of the window with a standard
/// deviation of a quarter of its length.
pub fn blend_weights(count: u32) -> Vec<f32> {
    if count <= 1 {
        return vec![1.0; count as usize];
    }

    let center = (count - 1) as f32 / 2.0;
    let sigma = (count as f32 / 4.0).max(0.5);
    let raw: Vec<f32> = (0..count)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();

    normalize(raw)
}

fn normalize(weights: Vec<f32>) -> Vec<f32> {
    let sum: f32 = weights.iter().sum();
    if sum <= 0.0 {
        let n = weights.len().max(1) as f32;
        return vec![1.0 / n; weights.len()];
    }
    weights.into_iter().map(|w| w / sum).collect()
}

/// Tracks which rendered frames are captured and what they blend.
#[derive(Debug, Clone)]
pub struct Accumulator {
    oversample: u32,
    weights: Vec<f32>,
    filled: usize,
}

impl Accumulator {
    pub fn new(oversample: u32, blend_frames: u32) -> Self {
        let blend_frames = blend_frames.clamp(1, MAX_BLEND_FRAMES);
        Self {
            oversample: oversample.max(1),
            weights: blend_weights(blend_frames),
            filled: 0,
        }
    }

    pub fn ring_size(&self) -> u32 {
        self.weights.len() as u32
    }

    /// Note that one more frame went into the ring.
    pub fn record_frame(&mut self) {
        self.filled = (self.filled + 1).min(self.weights.len());
    }

    /// Whether the zero-based rendered frame `frame` is captured.
    ///
    /// The first frame is always captured, then every `oversample`-th.
    pub fn captures(&self, frame: u64) -> bool {
        frame % self.oversample as u64 == 0
    }

    /// Weights for the frames currently in the ring, oldest first.
    ///
    /// Before the ring fills up the newest part of the curve is used and
    /// renormalized.
    pub fn current_weights(&self) -> Vec<f32> {
        let n = self.weights.len();
        if self.filled >= n {
            return self.weights.clone();
        }
        normalize(self.weights[n - self.filled..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_normalized(weights: &[f32]) {
        let sum: f32 = weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "sum was {}", sum);
    }

    #[test]
    fn test_weights_are_normalized_and_symmetric() {
        for n in [2, 5, 21, 64] {
            let weights = blend_weights(n);
            assert_eq!(weights.len(), n as usize);
            assert_normalized(&weights);
            for i in 0..weights.len() {
                let mirror = weights[weights.len() - 1 - i];
                assert!((weights[i] - mirror).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_weights_peak_in_the_middle() {
        let weights = blend_weights(5);
        assert!(weights[2] > weights[1]);
        assert!(weights[1] > weights[0]);
    }

    #[test]
    fn test_single_frame_is_identity() {
        assert_eq!(blend_weights(1), vec![1.0]);
    }

    #[test]
    fn test_capture_boundary() {
        let acc = Accumulator::new(4, 8);
        let captured: Vec<u64> = (0..12).filter(|&f| acc.captures(f)).collect();
        assert_eq!(captured, vec![0, 4, 8]);
    }

    #[test]
    fn test_partial_ring_renormalizes() {
        let mut acc = Accumulator::new(2, 4);
        acc.record_frame();
        assert_eq!(acc.current_weights(), vec![1.0]);

        acc.record_frame();
        let weights = acc.current_weights();
        assert_eq!(weights.len(), 2);
        assert_normalized(&weights);

        for _ in 0..10 {
            acc.record_frame();
        }
        assert_eq!(acc.current_weights().len(), 4);
    }

    #[test]
    fn test_blend_frames_are_clamped() {
        assert_eq!(Accumulator::new(1, 0).ring_size(), 1);
        assert_eq!(Accumulator::new(1, 1000).ring_size(), MAX_BLEND_FRAMES);
    }
}
