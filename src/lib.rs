//! Asynchronous GPU frame capture streamed into an external video encoder.
//!
//! A [`Recorder`] is driven from the render thread. Each captured frame is
//! read back from the GPU without stalling the renderer, converted to the
//! encoder's pixel layout on worker threads when needed, and written to an
//! ffmpeg process in capture order. Optional motion blur renders several
//! frames per output frame and blends them on the GPU.
//!
//! ## Modules
//! - `capture`: capture sequencer, slot pool, fences, streaming workers
//! - `config`: recording settings
//! - `encoder`: ffmpeg discovery, command line and process management
//! - `error`: pipeline error type
//! - `format`: pixel layouts and CPU conversions
//! - `gpu`: backend seam with software and `wgpu` implementations

pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod format;
pub mod gpu;

pub use capture::{CaptureOutcome, Recorder, RecordingStats};
pub use config::RecordingConfig;
pub use error::{PipelineError, PipelineResult};
pub use format::PixelLayout;
pub use gpu::{GpuBackend, SoftwareBackend, WgpuBackend};
