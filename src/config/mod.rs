//! Recording configuration.
//!
//! ## Architecture
//!
//! - `RecordingConfig`: every setting of one session (frame size, pixel
//!   format, motion blur, encoder, output location, pool size)
//! - `MotionBlurConfig`: oversampling and blend ring size
//! - `InputTransport`: how frames reach the encoder (named pipe or stdin)

pub mod recording;

pub use recording::{
    InputTransport, MotionBlurConfig, RecordingConfig, DEFAULT_POOL_SIZE, MAX_POOL_SIZE,
};
