//! GPU side of the capture pipeline.
//!
//! The capture sequencer drives a [`GpuBackend`] from the render thread: it
//! folds frames into the blend ring, runs the color-space pass, issues
//! asynchronous readbacks into per-slot [`ReadbackBuffer`]s and checks or
//! waits on the returned fences. Worker threads only ever touch the
//! `ReadbackBuffer` half, and only after its fence has signaled.
//!
//! ## Backends
//! - `software`: CPU canvas with the same math, fences with configurable
//!   latency. Used headless and in tests.
//! - `wgpu`: compute passes on a `wgpu` device, fences backed by submission
//!   indices and buffer mapping.

pub mod software;
pub mod wgpu;

use crate::error::PipelineResult;
use crate::format::PixelLayout;

pub use self::software::{SoftwareBackend, SoftwareReadback};
pub use self::wgpu::{WgpuBackend, WgpuReadback};

/// Geometry of one recording session, fixed at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGeometry {
    pub width: u32,
    pub height: u32,
    /// Layout the GPU writes into slots.
    pub capture_layout: PixelLayout,
    /// Size of the blend ring, `None` when accumulation is off.
    pub blend_frames: Option<u32>,
}

impl SessionGeometry {
    /// Bytes one readback region must hold.
    pub fn readback_size(&self) -> usize {
        self.capture_layout.frame_size(self.width, self.height)
    }
}

/// CPU-visible region a readback lands in.
///
/// Owned by a slot for the whole session. The bytes are only meaningful
/// between the fence of the last readback signaling and the next `recycle`.
pub trait ReadbackBuffer: Send + 'static {
    /// Run `f` over the bytes of the last completed readback.
    fn with_bytes<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T;

    /// Hand the region back to the GPU for the next readback.
    fn recycle(&mut self);
}

/// Render-thread half of the GPU seam.
pub trait GpuBackend {
    type Buffer: ReadbackBuffer;
    type Fence;
    /// What the renderer draws into between `begin_frame` and capture.
    type Target<'a>
    where
        Self: 'a;

    /// Create session resources (render target, blend ring, conversion pass).
    fn start_session(&mut self, geometry: &SessionGeometry) -> PipelineResult<()>;

    /// Allocate one readback region. Only called while the pool is built.
    fn allocate_readback(&mut self) -> PipelineResult<Self::Buffer>;

    /// Render target for the next frame.
    fn begin_frame(&mut self) -> Self::Target<'_>;

    /// Fold the frame just rendered into the blend ring.
    fn accumulate(&mut self) -> PipelineResult<()>;

    /// Blend the most recent `weights.len()` ring entries, oldest first, into
    /// the capture source.
    fn blend(&mut self, weights: &[f32]) -> PipelineResult<()>;

    /// Convert the capture source into `layout` planes ahead of readback.
    fn color_transform(&mut self, layout: PixelLayout) -> PipelineResult<()>;

    /// Start copying the current capture image into `buffer`.
    fn issue_readback(
        &mut self,
        buffer: &mut Self::Buffer,
        layout: PixelLayout,
    ) -> PipelineResult<Self::Fence>;

    /// Non-blocking fence check.
    fn is_signaled(&self, fence: &Self::Fence) -> PipelineResult<bool>;

    /// Block until the fence signals.
    fn wait(&self, fence: &Self::Fence) -> PipelineResult<()>;
}

/// Copy `src` into `dst` with the row order reversed.
///
/// Readbacks are delivered bottom row first; the encoder flips them back.
pub fn flip_rows(src: &[u8], dst: &mut [u8], row_bytes: usize) {
    let rows = src.len() / row_bytes;
    for (i, row) in src.chunks_exact(row_bytes).enumerate() {
        let dest_start = (rows - 1 - i) * row_bytes;
        dst[dest_start..dest_start + row_bytes].copy_from_slice(row);
    }
}
