//! Encoder families and codec option checks.

use std::path::Path;
use std::process::Stdio;

use super::create_hidden_command;
use crate::error::{PipelineError, PipelineResult};

/// Broad family of an ffmpeg video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFamily {
    /// NVIDIA NVENC hardware encoders (h264_nvenc, hevc_nvenc, av1_nvenc).
    Nvenc,
    /// Intel Quick Sync hardware encoders (*_qsv).
    Qsv,
    /// AMD AMF hardware encoders (*_amf).
    Amf,
    /// Software x264 encoder (libx264).
    X264,
    /// Software x265 encoder (libx265).
    X265,
    /// Any other codec, passed through unchecked.
    Other,
}

impl EncoderFamily {
    pub fn from_codec(codec: &str) -> Self {
        let codec = codec.trim();
        if codec.ends_with("_nvenc") {
            EncoderFamily::Nvenc
        } else if codec.ends_with("_qsv") {
            EncoderFamily::Qsv
        } else if codec.ends_with("_amf") {
            EncoderFamily::Amf
        } else if codec == "libx264" {
            EncoderFamily::X264
        } else if codec == "libx265" {
            EncoderFamily::X265
        } else {
            EncoderFamily::Other
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            EncoderFamily::Nvenc | EncoderFamily::Qsv | EncoderFamily::Amf
        )
    }

    /// Reject pixel formats the family cannot take.
    ///
    /// Hardware encoders have no 4:2:2 input path and no NV21 surface format.
    pub fn check_pixel_format(&self, pix_fmt: &str) -> PipelineResult<()> {
        let pix_fmt = pix_fmt.trim().to_ascii_lowercase();
        let unsupported = self.is_hardware()
            && (pix_fmt.starts_with("yuv422") || pix_fmt == "nv21" || pix_fmt == "nv16");

        if unsupported {
            return Err(PipelineError::Config(format!(
                "{:?} encoders cannot encode {}",
                self, pix_fmt
            )));
        }
        Ok(())
    }
}

/// Codec option names become `-name` arguments; keep them to plain option
/// syntax so they cannot smuggle extra arguments.
pub fn validate_option_name(name: &str) -> PipelineResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':'));

    if valid {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "invalid encoder option name '{}'",
            name
        )))
    }
}

/// Check that `codec` can encode a tiny test clip with this ffmpeg.
pub fn is_codec_available(ffmpeg_path: &Path, codec: &str) -> bool {
    // Hardware encoders have minimum frame sizes (~145x49), so use 256x256
    let result = create_hidden_command(ffmpeg_path)
        .args([
            "-hide_banner",
            "-f",
            "lavfi",
            "-i",
            "testsrc=duration=0.01:size=256x256:rate=1",
            "-c:v",
            codec,
            "-f",
            "null",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match result {
        Ok(status) => {
            let available = status.success();
            log::info!(
                "[ENCODER] {} availability check: {}",
                codec,
                if available {
                    "available"
                } else {
                    "not available"
                }
            );
            available
        },
        Err(e) => {
            log::debug!("[ENCODER] {} check failed: {}", codec, e);
            false
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_detection() {
        assert_eq!(EncoderFamily::from_codec("h264_nvenc"), EncoderFamily::Nvenc);
        assert_eq!(EncoderFamily::from_codec("hevc_qsv"), EncoderFamily::Qsv);
        assert_eq!(EncoderFamily::from_codec("h264_amf"), EncoderFamily::Amf);
        assert_eq!(EncoderFamily::from_codec("libx264"), EncoderFamily::X264);
        assert_eq!(EncoderFamily::from_codec("libx265"), EncoderFamily::X265);
        assert_eq!(EncoderFamily::from_codec("libvpx-vp9"), EncoderFamily::Other);
    }

    #[test]
    fn test_hardware_rejects_422() {
        let nvenc = EncoderFamily::Nvenc;
        assert!(nvenc.check_pixel_format("yuv422p").is_err());
        assert!(nvenc.check_pixel_format("nv21").is_err());
        assert!(nvenc.check_pixel_format("nv12").is_ok());
        assert!(EncoderFamily::X264.check_pixel_format("yuv422p").is_ok());
    }

    #[test]
    fn test_option_names() {
        assert!(validate_option_name("crf").is_ok());
        assert!(validate_option_name("x264-params").is_ok());
        assert!(validate_option_name("b:v").is_ok());
        assert!(validate_option_name("").is_err());
        assert!(validate_option_name("-y").is_err());
        assert!(validate_option_name("crf 10").is_err());
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        assert!(!is_codec_available(
            Path::new("/nonexistent/ffmpeg"),
            "libx264"
        ));
    }
}
