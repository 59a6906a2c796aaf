//! Recording configuration.
//!
//! One typed struct holds every setting of a recording session. It is loaded
//! from JSON, validated once, and then only read.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::capture::accumulation::MAX_BLEND_FRAMES;
use crate::encoder::codec::{validate_option_name, EncoderFamily};
use crate::error::{PipelineError, PipelineResult};
use crate::format::PixelLayout;

/// Largest slot pool a session may allocate.
pub const MAX_POOL_SIZE: usize = 32;

/// Slot pool size used when none is configured.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// How raw frames reach the encoder process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputTransport {
    /// Named pipe on Unix, standard input elsewhere.
    #[default]
    Auto,
    Stdin,
    NamedPipe,
}

impl InputTransport {
    /// Concrete transport for this platform.
    pub fn resolve(self) -> InputTransport {
        match self {
            InputTransport::Auto if cfg!(unix) => InputTransport::NamedPipe,
            InputTransport::Auto => InputTransport::Stdin,
            other => other,
        }
    }
}

/// Temporal accumulation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MotionBlurConfig {
    pub enabled: bool,

    /// Rendered frames per output frame.
    pub oversample_multiplier: u32,

    /// Frames blended into each output frame (1-64).
    pub blend_frames: u32,
}

impl Default for MotionBlurConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            oversample_multiplier: 16,
            blend_frames: 21,
        }
    }
}

/// Settings for one recording session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingConfig {
    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,

    /// Output frame rate. With motion blur this is the render rate.
    pub fps: u32,

    /// Maximum captures per second. 0 = unlimited.
    pub encoding_fps_cap: u32,

    /// ffmpeg pixel format of the encoded video (yuv420p, nv12, rgb24, ...).
    pub pixel_format: String,

    pub motion_blur: MotionBlurConfig,

    /// Extra ffmpeg video filters, appended after the vertical flip.
    pub filters: String,

    /// ffmpeg video codec name.
    pub encoder: String,

    /// Codec options passed as `-name value` pairs, in key order.
    pub encoder_options: BTreeMap<String, String>,

    /// Directory the video file is written to.
    pub output_dir: PathBuf,

    /// File name without extension. Empty = timestamp based.
    pub output_name: String,

    /// Container extension (mp4, mkv, mov, ...).
    pub container: String,

    /// Connect ffmpeg's stdout/stderr to ours.
    pub show_ffmpeg_logs: bool,

    /// Number of capture slots (1-32).
    pub pool_size: usize,

    pub input_transport: InputTransport,

    /// Explicit ffmpeg binary. None = bundled or system ffmpeg.
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        let mut encoder_options = BTreeMap::new();
        encoder_options.insert("crf".to_string(), "14".to_string());
        encoder_options.insert("preset".to_string(), "faster".to_string());

        Self {
            width: 1920,
            height: 1080,
            fps: 60,
            encoding_fps_cap: 0,
            pixel_format: "yuv420p".to_string(),
            motion_blur: MotionBlurConfig::default(),
            filters: String::new(),
            encoder: "libx264".to_string(),
            encoder_options,
            output_dir: PathBuf::from("videos"),
            output_name: String::new(),
            container: "mp4".to_string(),
            show_ffmpeg_logs: false,
            pool_size: DEFAULT_POOL_SIZE,
            input_transport: InputTransport::Auto,
            ffmpeg_path: None,
        }
    }
}

impl RecordingConfig {
    /// Read a JSON config file and validate it.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: RecordingConfig = serde_json::from_str(&content)?;
        config.validate()?;
        log::debug!("[CAPTURE] Loaded recording config from {}", path.display());
        Ok(config)
    }

    /// Clamp soft ranges and reject settings no session could run with.
    ///
    /// Also fixes an empty output name to a timestamp, so the output path is
    /// stable from here on.
    pub fn validate(&mut self) -> PipelineResult<()> {
        self.pool_size = self.pool_size.clamp(1, MAX_POOL_SIZE);
        self.fps = self.fps.max(1);

        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::Config(format!(
                "frame size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }

        let layout = self.output_layout();
        let (sx, sy) = layout.chroma_subsampling();
        if self.width as usize % sx != 0 || self.height as usize % sy != 0 {
            return Err(PipelineError::Config(format!(
                "{} needs dimensions divisible by {}x{}, got {}x{}",
                layout, sx, sy, self.width, self.height
            )));
        }

        if self.motion_blur.enabled {
            if self.motion_blur.oversample_multiplier == 0 {
                return Err(PipelineError::Config(
                    "motion blur oversample multiplier must be at least 1".to_string(),
                ));
            }
            if self.fps < self.motion_blur.oversample_multiplier {
                return Err(PipelineError::Config(format!(
                    "fps {} is lower than the oversample multiplier {}",
                    self.fps, self.motion_blur.oversample_multiplier
                )));
            }
            self.motion_blur.blend_frames = self.motion_blur.blend_frames.clamp(1, MAX_BLEND_FRAMES);
        }

        if self.encoder.trim().is_empty() {
            return Err(PipelineError::Config("encoder must not be empty".to_string()));
        }
        for name in self.encoder_options.keys() {
            validate_option_name(name)?;
        }
        EncoderFamily::from_codec(&self.encoder).check_pixel_format(&self.pixel_format)?;

        if self.container.is_empty() || !self.container.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(PipelineError::Config(format!(
                "invalid container '{}'",
                self.container
            )));
        }

        if self.output_name.is_empty() {
            self.output_name = chrono::Local::now()
                .format("recording_%Y-%m-%d_%H-%M-%S")
                .to_string();
        }

        Ok(())
    }

    /// Layout of the bytes streamed to the encoder.
    ///
    /// Formats the pipeline cannot produce are streamed as packed RGB and
    /// converted by ffmpeg.
    pub fn output_layout(&self) -> PixelLayout {
        PixelLayout::from_pix_fmt(&self.pixel_format).unwrap_or(PixelLayout::Rgb24)
    }

    /// Frame rate of the encoded video.
    pub fn encoded_fps(&self) -> u32 {
        if self.motion_blur.enabled {
            (self.fps / self.motion_blur.oversample_multiplier.max(1)).max(1)
        } else {
            self.fps
        }
    }

    /// Blend ring size, `None` when motion blur is off.
    pub fn blend_frames(&self) -> Option<u32> {
        self.motion_blur
            .enabled
            .then_some(self.motion_blur.blend_frames.clamp(1, MAX_BLEND_FRAMES))
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.output_name, self.container))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RecordingConfig {
        RecordingConfig {
            output_name: "clip".to_string(),
            ..RecordingConfig::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        let mut config = valid();
        config.validate().unwrap();
        assert_eq!(config.output_layout(), PixelLayout::I420);
        assert_eq!(config.encoded_fps(), 60);
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
    }

    #[test]
    fn test_pool_size_is_clamped() {
        let mut config = RecordingConfig {
            pool_size: 0,
            ..valid()
        };
        config.validate().unwrap();
        assert_eq!(config.pool_size, 1);

        config.pool_size = 500;
        config.validate().unwrap();
        assert_eq!(config.pool_size, MAX_POOL_SIZE);
    }

    #[test]
    fn test_odd_size_rejected_for_420() {
        let mut config = RecordingConfig {
            width: 1919,
            ..valid()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        config.pixel_format = "yuv444p".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_motion_blur_divides_fps() {
        let mut config = valid();
        config.fps = 960;
        config.motion_blur.enabled = true;
        config.motion_blur.oversample_multiplier = 16;
        config.validate().unwrap();
        assert_eq!(config.encoded_fps(), 60);
        assert_eq!(config.blend_frames(), Some(21));
    }

    #[test]
    fn test_motion_blur_rejects_zero_oversample() {
        let mut config = valid();
        config.motion_blur.enabled = true;
        config.motion_blur.oversample_multiplier = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_pixel_format_streams_rgb() {
        let config = RecordingConfig {
            pixel_format: "yuv420p10le".to_string(),
            ..valid()
        };
        assert_eq!(config.output_layout(), PixelLayout::Rgb24);
    }

    #[test]
    fn test_bad_option_name_rejected() {
        let mut config = valid();
        config
            .encoder_options
            .insert("-crf".to_string(), "20".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_name_gets_timestamp() {
        let mut config = RecordingConfig::default();
        config.validate().unwrap();
        assert!(config.output_name.starts_with("recording_"));
        assert!(config.output_path().to_string_lossy().ends_with(".mp4"));
    }

    #[test]
    fn test_camel_case_json_with_defaults() {
        let json = r#"{
            "width": 1280,
            "height": 720,
            "pixelFormat": "nv12",
            "encodingFpsCap": 30,
            "motionBlur": { "enabled": true, "oversampleMultiplier": 4 },
            "encoderOptions": { "preset": "fast" },
            "inputTransport": "stdin"
        }"#;
        let config: RecordingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.width, 1280);
        assert_eq!(config.output_layout(), PixelLayout::Nv12);
        assert_eq!(config.encoding_fps_cap, 30);
        assert_eq!(config.motion_blur.blend_frames, 21);
        assert_eq!(config.input_transport, InputTransport::Stdin);
        assert_eq!(config.encoder, "libx264");
        assert_eq!(config.encoder_options.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.json");
        fs::write(&path, r#"{ "width": 640, "height": 480, "outputName": "demo" }"#).unwrap();

        let config = RecordingConfig::load(&path).unwrap();
        assert_eq!(config.width, 640);
        assert_eq!(config.output_path(), PathBuf::from("videos").join("demo.mp4"));
    }

    #[test]
    fn test_auto_transport_resolves() {
        let resolved = InputTransport::Auto.resolve();
        if cfg!(unix) {
            assert_eq!(resolved, InputTransport::NamedPipe);
        } else {
            assert_eq!(resolved, InputTransport::Stdin);
        }
        assert_eq!(InputTransport::Stdin.resolve(), InputTransport::Stdin);
    }
}
