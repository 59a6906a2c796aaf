use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use framestream::{
    GpuBackend, PipelineResult, Recorder, RecordingConfig, RecordingStats, SoftwareBackend,
    WgpuBackend,
};
use image::{Rgb, RgbImage};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// CPU canvas, no GPU required
    Software,
    /// Headless wgpu device
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(name = "framestream")]
#[command(about = "Record an animated test pattern through the capture pipeline")]
#[command(version)]
struct Cli {
    /// Recording settings (JSON). Defaults are used for missing fields.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of output frames to record
    #[arg(short, long, default_value = "300")]
    frames: u64,

    /// Where frames are rendered and read back
    #[arg(short, long, value_enum, default_value = "software")]
    backend: Backend,

    /// Override the output directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    dump_config: bool,
}

fn main() -> ExitCode {
    // Set RUST_LOG to control the log level, e.g. RUST_LOG=framestream=debug
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        },
    }
}

fn run(cli: Cli) -> PipelineResult<()> {
    let mut config = match &cli.config {
        Some(path) => RecordingConfig::load(path)?,
        None => RecordingConfig::default(),
    };
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }

    if cli.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let renders = if config.motion_blur.enabled {
        cli.frames * config.motion_blur.oversample_multiplier.max(1) as u64
    } else {
        cli.frames
    };
    let (width, height) = (config.width, config.height);

    let stats = match cli.backend {
        Backend::Software => {
            let recorder = Recorder::start(&config, SoftwareBackend::new())?;
            record(recorder, renders, |recorder, frame| {
                draw_pattern(recorder.begin_frame(), frame);
                Ok(())
            })?
        },
        Backend::Wgpu => {
            let recorder = Recorder::start(&config, WgpuBackend::headless()?)?;
            let mut canvas = RgbImage::new(width, height);
            let mut rgba = vec![0u8; width as usize * height as usize * 4];
            record(recorder, renders, move |recorder, frame| {
                recorder.begin_frame();
                draw_pattern(&mut canvas, frame);
                for (dst, src) in rgba.chunks_exact_mut(4).zip(canvas.pixels()) {
                    dst[..3].copy_from_slice(&src.0);
                    dst[3] = 255;
                }
                recorder.backend().upload_frame(&rgba)
            })?
        },
    };

    println!(
        "Recorded {} frames ({} rendered, {:.1} MiB) in {:.2}s to {}",
        stats.frames_written,
        stats.frames_rendered,
        stats.bytes_written as f64 / (1024.0 * 1024.0),
        stats.elapsed.as_secs_f64(),
        config.output_dir.display()
    );
    Ok(())
}

/// Render and capture `renders` frames, then finish the recording.
fn record<B: GpuBackend>(
    mut recorder: Recorder<B>,
    renders: u64,
    mut draw: impl FnMut(&mut Recorder<B>, u64) -> PipelineResult<()>,
) -> PipelineResult<RecordingStats> {
    for frame in 0..renders {
        let result = draw(&mut recorder, frame).and_then(|_| recorder.capture_frame());
        if let Err(e) = result {
            // Still drain so the encoder can close the file
            if let Err(shutdown) = recorder.finish() {
                log::debug!("Shutdown after failure: {}", shutdown);
            }
            return Err(e);
        }
    }
    recorder.finish()
}

/// Scrolling gradient with a moving vertical bar.
fn draw_pattern(canvas: &mut RgbImage, frame: u64) {
    let (width, height) = canvas.dimensions();
    let bar_width = (width / 16).max(1);
    let bar_x = (frame * 8 % width.max(1) as u64) as u32;

    for (x, y, pixel) in canvas.enumerate_pixels_mut() {
        let in_bar = x >= bar_x && x < bar_x + bar_width;
        *pixel = Rgb([
            ((x as u64 + frame * 2) % 256) as u8,
            (y * 255 / height.max(1)) as u8,
            if in_bar { 255 } else { 48 },
        ]);
    }
}
