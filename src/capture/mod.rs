//! Asynchronous frame capture.
//!
//! The [`Recorder`] runs on the render thread. For every captured frame it
//! issues a non-blocking GPU readback into a pooled slot and moves on; fences
//! are checked on later frames and signaled slots are handed to the streaming
//! workers, which convert and write them to the encoder in capture order.
//!
//! ## Components
//! - `pool`: fixed set of capture slots and their lifecycle
//! - `fence`: submission-ordered queue of in-flight readbacks
//! - `workers`: dispatch and writer threads
//! - `limiter`: capture rate cap
//! - `accumulation`: motion blur capture boundary and blend weights
//!
//! The render thread only blocks when every slot is busy: it then waits for
//! the oldest readback, and if all slots are still with the writer, for the
//! writer to release one.

pub mod accumulation;
pub mod fence;
pub mod limiter;
pub mod pool;
pub mod workers;


use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RecordingConfig;
use crate::encoder::{EncoderInput, EncoderProcess};
use crate::error::{PipelineError, PipelineResult};
use crate::gpu::{GpuBackend, SessionGeometry};

pub use accumulation::Accumulator;
pub use fence::{FenceTracker, Retire};
pub use limiter::RateLimiter;
pub use pool::{Slot, SlotCensus, SlotPool, SlotState};
pub use workers::{FailureCell, FrameFormat, StreamWorkers, WriterReport};

/// What `capture_frame` did with the frame just rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A readback was issued; `frame` is the zero-based output frame index.
    Captured { frame: u64 },
    /// Folded into the blend ring only.
    Accumulated,
}

/// Totals for a finished recording.
#[derive(Debug, Clone)]
pub struct RecordingStats {
    pub frames_rendered: u64,
    pub frames_captured: u64,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
    /// Exit status of the encoder, `None` when writing to a plain stream.
    pub encoder_exit: Option<ExitStatus>,
}

/// Capture sequencer for one recording session.
pub struct Recorder<B: GpuBackend> {
    backend: B,
    format: FrameFormat,
    pool: Arc<SlotPool<B::Buffer>>,
    fences: FenceTracker<B::Buffer, B::Fence>,
    workers: Option<StreamWorkers<B::Buffer>>,
    encoder: Option<EncoderProcess>,
    failure: Arc<FailureCell>,
    limiter: RateLimiter,
    accumulator: Option<Accumulator>,
    frames_rendered: u64,
    frames_captured: u64,
    started: Instant,
}

impl<B: GpuBackend> Recorder<B> {
    /// Start a session that streams into a new ffmpeg process.
    pub fn start(config: &RecordingConfig, backend: B) -> PipelineResult<Self> {
        let mut config = config.clone();
        config.validate()?;

        let (backend, pool, format) = Self::prepare(&config, backend)?;
        let (encoder, input) = EncoderProcess::spawn(&config)?;
        log::info!(
            "[CAPTURE] Recording to {}",
            config.output_path().display()
        );
        Self::assemble(&config, backend, pool, format, input, Some(encoder))
    }

    /// Start a session that streams raw frames into `output`.
    pub fn with_output(
        config: &RecordingConfig,
        backend: B,
        output: EncoderInput,
    ) -> PipelineResult<Self> {
        let mut config = config.clone();
        config.validate()?;

        let (backend, pool, format) = Self::prepare(&config, backend)?;
        Self::assemble(&config, backend, pool, format, output, None)
    }

    /// Allocate every GPU resource the session needs.
    fn prepare(
        config: &RecordingConfig,
        mut backend: B,
    ) -> PipelineResult<(B, Arc<SlotPool<B::Buffer>>, FrameFormat)> {
        let format = FrameFormat::new(config.width, config.height, config.output_layout());
        backend.start_session(&SessionGeometry {
            width: format.width,
            height: format.height,
            capture_layout: format.capture,
            blend_frames: config.blend_frames(),
        })?;

        let readbacks = (0..config.pool_size)
            .map(|_| backend.allocate_readback())
            .collect::<PipelineResult<Vec<_>>>()?;
        let pool = Arc::new(SlotPool::new(readbacks, format.conversion_buffer_size()));

        Ok((backend, pool, format))
    }

    fn assemble(
        config: &RecordingConfig,
        backend: B,
        pool: Arc<SlotPool<B::Buffer>>,
        format: FrameFormat,
        output: EncoderInput,
        encoder: Option<EncoderProcess>,
    ) -> PipelineResult<Self> {
        let failure = Arc::new(FailureCell::default());
        let workers = match StreamWorkers::spawn(
            Arc::clone(&pool),
            format,
            output,
            Arc::clone(&failure),
        ) {
            Ok(workers) => workers,
            Err(e) => {
                if let Some(encoder) = encoder {
                    encoder.abort();
                }
                return Err(e);
            },
        };

        let accumulator = config.motion_blur.enabled.then(|| {
            Accumulator::new(
                config.motion_blur.oversample_multiplier,
                config.motion_blur.blend_frames,
            )
        });

        log::info!(
            "[CAPTURE] Started {}x{} {} (captured as {}), {} slots, {} fps{}",
            format.width,
            format.height,
            format.target,
            format.capture,
            pool.capacity(),
            config.encoded_fps(),
            match &accumulator {
                Some(acc) => format!(
                    ", motion blur x{} over {} frames",
                    config.motion_blur.oversample_multiplier,
                    acc.ring_size()
                ),
                None => String::new(),
            }
        );

        let limiter = RateLimiter::new(config.encoding_fps_cap);
        if !limiter.is_unlimited() {
            log::info!(
                "[CAPTURE] Capture rate capped at {} fps",
                config.encoding_fps_cap
            );
        }

        Ok(Self {
            backend,
            format,
            fences: FenceTracker::with_capacity(pool.capacity()),
            pool,
            workers: Some(workers),
            encoder,
            failure,
            limiter,
            accumulator,
            frames_rendered: 0,
            frames_captured: 0,
            started: Instant::now(),
        })
    }

    /// Render target for the next frame.
    pub fn begin_frame(&mut self) -> B::Target<'_> {
        self.backend.begin_frame()
    }

    /// Capture the frame just rendered.
    ///
    /// Returns once the readback is issued; the bytes reach the encoder later.
    /// Blocks only when every slot is in use. Any error is fatal to the
    /// session; call [`Recorder::finish`] to tear it down.
    pub fn capture_frame(&mut self) -> PipelineResult<CaptureOutcome> {
        self.failure.check()?;

        let rendered = self.frames_rendered;
        self.frames_rendered += 1;

        if self.accumulator.is_some() {
            self.backend.accumulate().map_err(|e| self.fail(e))?;

            let weights = self.accumulator.as_mut().and_then(|acc| {
                acc.record_frame();
                acc.captures(rendered).then(|| acc.current_weights())
            });
            let Some(weights) = weights else {
                return Ok(CaptureOutcome::Accumulated);
            };
            self.backend.blend(&weights).map_err(|e| self.fail(e))?;
        }

        if self.format.capture.is_yuv() {
            self.backend
                .color_transform(self.format.capture)
                .map_err(|e| self.fail(e))?;
        }

        let mode = if self.pool.free_count() == 0 {
            Retire::WaitFirst
        } else {
            Retire::Poll
        };
        self.retire(mode)?;

        let mut slot = self.pool.acquire()?;
        let fence = match self
            .backend
            .issue_readback(slot.readback_mut(), self.format.capture)
        {
            Ok(fence) => fence,
            Err(e) => return Err(self.fail(e)),
        };
        self.fences.track(slot, fence);

        self.retire(Retire::Poll)?;

        let frame = self.frames_captured;
        self.frames_captured += 1;
        self.limiter.sync();

        Ok(CaptureOutcome::Captured { frame })
    }

    /// Drain every in-flight frame, stop the workers and wait for the encoder.
    ///
    /// Returns the first fatal error of the session, if any.
    pub fn finish(mut self) -> PipelineResult<RecordingStats> {
        self.teardown()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn census(&self) -> SlotCensus {
        self.pool.census()
    }

    /// Readbacks issued but not yet retired.
    pub fn frames_in_flight(&self) -> usize {
        self.fences.len()
    }

    fn fail(&self, error: PipelineError) -> PipelineError {
        log::error!("[CAPTURE] {}", error);
        self.failure.record(&error);
        self.pool.abort(&error.to_string());
        error
    }

    fn retire(&mut self, mode: Retire) -> PipelineResult<usize> {
        let workers = self.workers.as_ref().ok_or_else(|| {
            PipelineError::PipelineFailed("recording already finished".to_string())
        })?;
        let result = self
            .fences
            .retire(&self.backend, mode, |slot| workers.submit(slot));
        result.map_err(|e| self.fail(e))
    }

    fn teardown(&mut self) -> PipelineResult<RecordingStats> {
        let mut first_error = None;

        if let Some(workers) = self.workers.as_ref() {
            let drained = self
                .fences
                .retire(&self.backend, Retire::WaitAll, |slot| workers.submit(slot));
            if let Err(e) = drained {
                log::error!("[CAPTURE] Draining readbacks failed: {}", e);
                first_error = Some(e);
            }
        }

        let (frames_written, bytes_written) = match self.workers.take() {
            Some(workers) => match workers.shutdown() {
                Ok(WriterReport {
                    output,
                    frames_written,
                    bytes_written,
                    error,
                }) => {
                    // Closing the input lets the encoder finish the file
                    drop(output);
                    if let Some(e) = error {
                        first_error.get_or_insert(e);
                    }
                    (frames_written, bytes_written)
                },
                Err(e) => {
                    first_error.get_or_insert(e);
                    (0, 0)
                },
            },
            None => {
                return Err(PipelineError::PipelineFailed(
                    "recording already finished".to_string(),
                ))
            },
        };

        let encoder_exit = match self.encoder.take() {
            Some(encoder) => match encoder.finish() {
                Ok(status) => Some(status),
                Err(e) => {
                    first_error.get_or_insert(e);
                    None
                },
            },
            None => None,
        };

        let stats = RecordingStats {
            frames_rendered: self.frames_rendered,
            frames_captured: self.frames_captured,
            frames_written,
            bytes_written,
            elapsed: self.started.elapsed(),
            encoder_exit,
        };

        log::info!(
            "[CAPTURE] Recording finished: {} rendered, {} captured, {} written ({} bytes) in {:.2}s",
            stats.frames_rendered,
            stats.frames_captured,
            stats.frames_written,
            stats.bytes_written,
            stats.elapsed.as_secs_f64()
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

impl<B: GpuBackend> Drop for Recorder<B> {
    fn drop(&mut self) {
        if self.workers.is_some() {
            log::warn!("[CAPTURE] Recorder dropped without finish(), shutting down");
            if let Err(e) = self.teardown() {
                log::error!("[CAPTURE] Shutdown after drop failed: {}", e);
            }
        }
    }
}
