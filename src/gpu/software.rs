//! CPU implementation of the GPU seam.
//!
//! Frames are drawn into an `RgbImage` canvas. Readbacks are performed at
//! issue time but their fences only signal after `latency` further readbacks
//! have been issued (or when waited on), which mimics a GPU running a few
//! frames behind the render thread.

use std::sync::atomic::{AtomicU64, Ordering};

use image::RgbImage;

use super::{flip_rows, GpuBackend, ReadbackBuffer, SessionGeometry};
use crate::error::{PipelineError, PipelineResult};
use crate::format::{rgb_to_planar, PixelLayout};

/// Default number of readbacks a fence trails behind.
const DEFAULT_LATENCY: u64 = 2;

/// Readback region backed by host memory.
#[derive(Debug, Default)]
pub struct SoftwareReadback {
    bytes: Vec<u8>,
}

impl ReadbackBuffer for SoftwareReadback {
    fn with_bytes<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.bytes)
    }

    fn recycle(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareFence {
    submission: u64,
}

pub struct SoftwareBackend {
    latency: u64,
    submitted: u64,
    completed: AtomicU64,
    geometry: Option<SessionGeometry>,
    frame: RgbImage,
    ring: Vec<RgbImage>,
    head: usize,
    blended: RgbImage,
    use_blended: bool,
    flipped: Vec<u8>,
    planar: Vec<u8>,
    planar_layout: Option<PixelLayout>,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::with_latency(DEFAULT_LATENCY)
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose fences signal `latency` readbacks after being issued.
    pub fn with_latency(latency: u64) -> Self {
        Self {
            latency,
            submitted: 0,
            completed: AtomicU64::new(0),
            geometry: None,
            frame: RgbImage::new(0, 0),
            ring: Vec::new(),
            head: 0,
            blended: RgbImage::new(0, 0),
            use_blended: false,
            flipped: Vec::new(),
            planar: Vec::new(),
            planar_layout: None,
        }
    }

    /// Readbacks issued so far.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    fn geometry(&self) -> PipelineResult<SessionGeometry> {
        self.geometry
            .ok_or_else(|| PipelineError::Gpu("no capture session started".to_string()))
    }

    fn source(&self) -> &RgbImage {
        if self.use_blended {
            &self.blended
        } else {
            &self.frame
        }
    }
}

impl GpuBackend for SoftwareBackend {
    type Buffer = SoftwareReadback;
    type Fence = SoftwareFence;
    type Target<'a> = &'a mut RgbImage;

    fn start_session(&mut self, geometry: &SessionGeometry) -> PipelineResult<()> {
        let (w, h) = (geometry.width, geometry.height);
        self.frame = RgbImage::new(w, h);
        self.ring = match geometry.blend_frames {
            Some(n) => (0..n).map(|_| RgbImage::new(w, h)).collect(),
            None => Vec::new(),
        };
        self.blended = if geometry.blend_frames.is_some() {
            RgbImage::new(w, h)
        } else {
            RgbImage::new(0, 0)
        };
        self.head = 0;
        self.use_blended = false;
        self.flipped = vec![0u8; w as usize * h as usize * 3];
        self.planar = if geometry.capture_layout.is_yuv() {
            vec![0u8; geometry.readback_size()]
        } else {
            Vec::new()
        };
        self.planar_layout = None;
        self.geometry = Some(*geometry);

        log::debug!(
            "[GPU] Software session {}x{} capture={} ring={}",
            w,
            h,
            geometry.capture_layout,
            self.ring.len()
        );
        Ok(())
    }

    fn allocate_readback(&mut self) -> PipelineResult<SoftwareReadback> {
        let geometry = self.geometry()?;
        Ok(SoftwareReadback {
            bytes: vec![0u8; geometry.readback_size()],
        })
    }

    fn begin_frame(&mut self) -> &mut RgbImage {
        self.use_blended = false;
        &mut self.frame
    }

    fn accumulate(&mut self) -> PipelineResult<()> {
        if self.ring.is_empty() {
            return Err(PipelineError::Gpu(
                "accumulation is not enabled for this session".to_string(),
            ));
        }
        let head = self.head;
        let layer: &mut [u8] = &mut self.ring[head];
        layer.copy_from_slice(self.frame.as_raw());
        self.head = (head + 1) % self.ring.len();
        Ok(())
    }

    fn blend(&mut self, weights: &[f32]) -> PipelineResult<()> {
        let capacity = self.ring.len();
        let count = weights.len();
        if count == 0 || count > capacity {
            return Err(PipelineError::Gpu(format!(
                "cannot blend {} frames from a ring of {}",
                count, capacity
            )));
        }

        let layers: Vec<&[u8]> = (0..count)
            .map(|i| self.ring[(self.head + capacity - count + i) % capacity].as_raw().as_slice())
            .collect();

        let out: &mut [u8] = &mut self.blended;
        for (idx, value) in out.iter_mut().enumerate() {
            let sum: f32 = layers
                .iter()
                .zip(weights)
                .map(|(layer, w)| layer[idx] as f32 * w)
                .sum();
            *value = sum.round().clamp(0.0, 255.0) as u8;
        }

        self.use_blended = true;
        Ok(())
    }

    fn color_transform(&mut self, layout: PixelLayout) -> PipelineResult<()> {
        let geometry = self.geometry()?;
        if layout != geometry.capture_layout || !layout.is_yuv() {
            return Err(PipelineError::Gpu(format!(
                "color transform to {} in a {} session",
                layout, geometry.capture_layout
            )));
        }

        let row_bytes = geometry.width as usize * 3;
        let mut flipped = std::mem::take(&mut self.flipped);
        flip_rows(self.source().as_raw(), &mut flipped, row_bytes);
        let result = rgb_to_planar(
            &flipped,
            layout,
            &mut self.planar,
            geometry.width,
            geometry.height,
        );
        self.flipped = flipped;
        result?;

        self.planar_layout = Some(layout);
        Ok(())
    }

    fn issue_readback(
        &mut self,
        buffer: &mut SoftwareReadback,
        layout: PixelLayout,
    ) -> PipelineResult<SoftwareFence> {
        let geometry = self.geometry()?;
        let size = geometry.readback_size();
        if buffer.bytes.len() != size || layout != geometry.capture_layout {
            return Err(PipelineError::Gpu(format!(
                "readback of {} into a {} byte region, session expects {} ({} bytes)",
                layout,
                buffer.bytes.len(),
                geometry.capture_layout,
                size
            )));
        }

        if layout.is_yuv() {
            if self.planar_layout.take() != Some(layout) {
                return Err(PipelineError::Gpu(
                    "readback issued before the color transform".to_string(),
                ));
            }
            buffer.bytes.copy_from_slice(&self.planar[..size]);
        } else {
            flip_rows(
                self.source().as_raw(),
                &mut buffer.bytes,
                geometry.width as usize * 3,
            );
        }

        self.submitted += 1;
        Ok(SoftwareFence {
            submission: self.submitted,
        })
    }

    fn is_signaled(&self, fence: &SoftwareFence) -> PipelineResult<bool> {
        Ok(fence.submission.saturating_add(self.latency) <= self.submitted
            || fence.submission <= self.completed.load(Ordering::Acquire))
    }

    fn wait(&self, fence: &SoftwareFence) -> PipelineResult<()> {
        self.completed.fetch_max(fence.submission, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn session(layout: PixelLayout, blend: Option<u32>) -> SoftwareBackend {
        let mut backend = SoftwareBackend::with_latency(0);
        backend
            .start_session(&SessionGeometry {
                width: 2,
                height: 2,
                capture_layout: layout,
                blend_frames: blend,
            })
            .unwrap();
        backend
    }

    fn fill(backend: &mut SoftwareBackend, value: u8) {
        let frame = backend.begin_frame();
        for pixel in frame.pixels_mut() {
            *pixel = Rgb([value, value, value]);
        }
    }

    #[test]
    fn test_rgb_readback_is_bottom_up() {
        let mut backend = session(PixelLayout::Rgb24, None);
        let frame = backend.begin_frame();
        frame.put_pixel(0, 0, Rgb([1, 1, 1]));
        frame.put_pixel(0, 1, Rgb([2, 2, 2]));

        let mut buffer = backend.allocate_readback().unwrap();
        backend
            .issue_readback(&mut buffer, PixelLayout::Rgb24)
            .unwrap();
        buffer.with_bytes(|bytes| {
            assert_eq!(bytes[0], 2);
            assert_eq!(bytes[6], 1);
        });
    }

    #[test]
    fn test_yuv_readback_requires_color_transform() {
        let mut backend = session(PixelLayout::I420, None);
        fill(&mut backend, 255);
        let mut buffer = backend.allocate_readback().unwrap();
        assert!(backend
            .issue_readback(&mut buffer, PixelLayout::I420)
            .is_err());

        backend.color_transform(PixelLayout::I420).unwrap();
        backend
            .issue_readback(&mut buffer, PixelLayout::I420)
            .unwrap();
        buffer.with_bytes(|bytes| assert_eq!(bytes, &[235, 235, 235, 235, 128, 128]));
    }

    #[test]
    fn test_blend_uses_most_recent_frames() {
        let mut backend = session(PixelLayout::Rgb24, Some(3));
        for value in [0, 100, 200] {
            fill(&mut backend, value);
            backend.accumulate().unwrap();
        }
        // Last two frames only: 100 and 200
        backend.blend(&[0.5, 0.5]).unwrap();

        let mut buffer = backend.allocate_readback().unwrap();
        backend
            .issue_readback(&mut buffer, PixelLayout::Rgb24)
            .unwrap();
        buffer.with_bytes(|bytes| assert!(bytes.iter().all(|&b| b == 150)));
    }

    #[test]
    fn test_blend_wraps_around_ring() {
        let mut backend = session(PixelLayout::Rgb24, Some(2));
        for value in [10, 20, 30, 40] {
            fill(&mut backend, value);
            backend.accumulate().unwrap();
        }
        backend.blend(&[1.0, 0.0]).unwrap();
        let mut buffer = backend.allocate_readback().unwrap();
        backend
            .issue_readback(&mut buffer, PixelLayout::Rgb24)
            .unwrap();
        buffer.with_bytes(|bytes| assert_eq!(bytes[0], 30));
    }

    #[test]
    fn test_accumulate_without_ring_fails() {
        let mut backend = session(PixelLayout::Rgb24, None);
        assert!(backend.accumulate().is_err());
    }

    #[test]
    fn test_fence_latency() {
        let mut backend = SoftwareBackend::with_latency(2);
        backend
            .start_session(&SessionGeometry {
                width: 1,
                height: 1,
                capture_layout: PixelLayout::Rgb24,
                blend_frames: None,
            })
            .unwrap();
        let mut buffer = backend.allocate_readback().unwrap();

        let first = backend
            .issue_readback(&mut buffer, PixelLayout::Rgb24)
            .unwrap();
        assert!(!backend.is_signaled(&first).unwrap());

        let second = backend
            .issue_readback(&mut buffer, PixelLayout::Rgb24)
            .unwrap();
        assert!(!backend.is_signaled(&first).unwrap());

        backend
            .issue_readback(&mut buffer, PixelLayout::Rgb24)
            .unwrap();
        assert!(backend.is_signaled(&first).unwrap());
        assert!(!backend.is_signaled(&second).unwrap());

        backend.wait(&second).unwrap();
        assert!(backend.is_signaled(&second).unwrap());
    }
}
