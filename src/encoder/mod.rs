//! External video encoder.
//!
//! ## Components
//! - `args`: ffmpeg command line for raw frame input
//! - `codec`: encoder families, pixel format and option checks, codec probe
//! - `pipe`: named pipe input (Unix)
//! - `process`: spawning, feeding and reaping the ffmpeg process

pub mod args;
pub mod codec;
pub mod pipe;
pub mod process;

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub use args::build_args;
pub use codec::EncoderFamily;
pub use pipe::NamedPipe;
pub use process::{EncoderInput, EncoderProcess};

/// Create a Command configured to hide the console window on Windows.
pub fn create_hidden_command(program: &Path) -> Command {
    let cmd = Command::new(program);

    #[cfg(windows)]
    let cmd = {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        let mut cmd = cmd;
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    };

    cmd
}

/// Find a working ffmpeg binary.
///
/// Tries the explicitly configured path, then ffmpeg-sidecar's bundled
/// binary, then the system PATH. Each candidate must pass `-version`.
pub fn find_ffmpeg(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if test_ffmpeg_binary(path) {
            log::debug!("[FFMPEG] Using configured path: {}", path.display());
            return Some(path.to_path_buf());
        }
        log::warn!(
            "[FFMPEG] Configured ffmpeg {} does not run, searching elsewhere",
            path.display()
        );
    }

    let sidecar_path = ffmpeg_sidecar::paths::ffmpeg_path();
    if test_ffmpeg_binary(&sidecar_path) {
        log::debug!("[FFMPEG] Using sidecar path: {}", sidecar_path.display());
        return Some(sidecar_path);
    }

    log::debug!(
        "[FFMPEG] Sidecar path failed ({}), trying system PATH",
        sidecar_path.display()
    );

    let binary_name = if cfg!(windows) {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    };

    if let Some(path) = find_in_system_path(binary_name) {
        if test_ffmpeg_binary(&path) {
            log::debug!("[FFMPEG] Using system PATH: {}", path.display());
            return Some(path);
        }
    }

    log::warn!("[FFMPEG] No working ffmpeg found");
    None
}

/// Test if an ffmpeg binary works by running -version
fn test_ffmpeg_binary(path: &Path) -> bool {
    create_hidden_command(path)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Find an executable in system PATH
fn find_in_system_path(name: &str) -> Option<PathBuf> {
    let cmd = if cfg!(windows) { "where" } else { "which" };

    Command::new(cmd)
        .arg(name)
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                let path_str = String::from_utf8_lossy(&output.stdout);
                let first_line = path_str.lines().next()?.trim();
                if !first_line.is_empty() {
                    return Some(PathBuf::from(first_line));
                }
            }
            None
        })
}
