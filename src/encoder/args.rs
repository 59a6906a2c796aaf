//! ffmpeg command line for raw frame input.

use crate::config::RecordingConfig;
use crate::format::PixelLayout;

/// Containers that understand `-movflags +write_colr`.
const MOV_FAMILY: &[&str] = &["mp4", "mov", "m4v"];

/// Build the ffmpeg arguments for a session reading raw frames from `input`.
///
/// Frames arrive bottom row first, so the filter chain always starts with a
/// vertical flip. Output is tagged BT.709 limited range.
pub fn build_args(config: &RecordingConfig, input: &str) -> Vec<String> {
    let layout = config.output_layout();

    let mut args = vec![
        "-y".to_string(),
        // Raw frames from the pipe
        "-f".to_string(),
        "rawvideo".to_string(),
        "-vcodec".to_string(),
        "rawvideo".to_string(),
        "-s".to_string(),
        format!("{}x{}", config.width, config.height),
        "-pix_fmt".to_string(),
        layout.pix_fmt().to_string(),
        "-r".to_string(),
        config.encoded_fps().to_string(),
        "-i".to_string(),
        input.to_string(),
        "-an".to_string(),
    ];

    let mut filters = "vflip".to_string();
    let extra = config.filters.trim();
    if !extra.is_empty() {
        filters.push(',');
        filters.push_str(extra);
    }
    args.extend(["-vf".to_string(), filters]);

    args.extend([
        "-c:v".to_string(),
        config.encoder.trim().to_string(),
        "-color_range".to_string(),
        "1".to_string(),
        "-colorspace".to_string(),
        "1".to_string(),
        "-color_trc".to_string(),
        "1".to_string(),
        "-color_primaries".to_string(),
        "1".to_string(),
    ]);

    if MOV_FAMILY.contains(&config.container.to_ascii_lowercase().as_str()) {
        args.extend(["-movflags".to_string(), "+write_colr".to_string()]);
    }

    // Formats we cannot produce are streamed as RGB and converted by ffmpeg
    if layout == PixelLayout::Rgb24 {
        args.extend(["-pix_fmt".to_string(), config.pixel_format.trim().to_string()]);
    }

    for (name, value) in &config.encoder_options {
        args.extend([format!("-{}", name), value.clone()]);
    }

    args.push(config.output_path().to_string_lossy().to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RecordingConfig {
        RecordingConfig {
            width: 1280,
            height: 720,
            fps: 30,
            output_name: "clip".to_string(),
            ..RecordingConfig::default()
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_raw_input_description() {
        let args = build_args(&config(), "/tmp/frames.pipe");
        assert_eq!(args[0], "-y");
        assert_eq!(value_after(&args, "-s"), vec!["1280x720"]);
        assert_eq!(value_after(&args, "-r"), vec!["30"]);
        assert_eq!(value_after(&args, "-i"), vec!["/tmp/frames.pipe"]);
        assert_eq!(value_after(&args, "-pix_fmt"), vec!["yuv420p"]);
        assert!(args.contains(&"-an".to_string()));
    }

    #[test]
    fn test_filters_follow_vflip() {
        let mut config = config();
        assert_eq!(value_after(&build_args(&config, "-"), "-vf"), vec!["vflip"]);

        config.filters = "scale=640:-2".to_string();
        assert_eq!(
            value_after(&build_args(&config, "-"), "-vf"),
            vec!["vflip,scale=640:-2"]
        );
    }

    #[test]
    fn test_color_tags_and_movflags() {
        let args = build_args(&config(), "-");
        assert_eq!(value_after(&args, "-colorspace"), vec!["1"]);
        assert_eq!(value_after(&args, "-movflags"), vec!["+write_colr"]);

        let mut mkv = config();
        mkv.container = "mkv".to_string();
        assert!(value_after(&build_args(&mkv, "-"), "-movflags").is_empty());
    }

    #[test]
    fn test_rgb_input_gets_output_pix_fmt() {
        let mut config = config();
        config.pixel_format = "yuv420p10le".to_string();
        let args = build_args(&config, "-");
        assert_eq!(value_after(&args, "-pix_fmt"), vec!["rgb24", "yuv420p10le"]);
    }

    #[test]
    fn test_codec_options_and_output_last() {
        let args = build_args(&config(), "-");
        assert_eq!(value_after(&args, "-c:v"), vec!["libx264"]);
        assert_eq!(value_after(&args, "-crf"), vec!["14"]);
        assert_eq!(value_after(&args, "-preset"), vec!["faster"]);
        assert!(args
            .last()
            .map(|path| path.ends_with("clip.mp4"))
            .unwrap_or(false));
    }

    #[test]
    fn test_motion_blur_lowers_rate() {
        let mut config = config();
        config.fps = 240;
        config.motion_blur.enabled = true;
        config.motion_blur.oversample_multiplier = 8;
        assert_eq!(value_after(&build_args(&config, "-"), "-r"), vec!["30"]);
    }
}
