//! Encoder subprocess lifecycle.

use std::io::Write;
use std::process::{Child, Command, ExitStatus, Stdio};

use super::args::build_args;
use super::codec::is_codec_available;
use super::pipe::NamedPipe;
use super::{create_hidden_command, find_ffmpeg};
use crate::config::{InputTransport, RecordingConfig};
use crate::error::{OptionExt, PipelineError, PipelineResult};

/// Raw frame input of a running encoder.
pub type EncoderInput = Box<dyn Write + Send>;

/// A running ffmpeg process fed with raw frames.
///
/// The input stream is handed out separately at spawn so the writer thread
/// can own it. Closing that stream is what tells the encoder to finish.
pub struct EncoderProcess {
    child: Child,
    /// Kept alive until the process is reaped; removes the pipe on drop.
    pipe: Option<NamedPipe>,
}

impl EncoderProcess {
    /// Resolve ffmpeg, build the command line from `config` and start it.
    pub fn spawn(config: &RecordingConfig) -> PipelineResult<(Self, EncoderInput)> {
        let ffmpeg = find_ffmpeg(config.ffmpeg_path.as_deref()).ok_or(PipelineError::EncoderNotFound)?;

        if !is_codec_available(&ffmpeg, config.encoder.trim()) {
            return Err(PipelineError::EncoderStart(format!(
                "codec '{}' is not available in {}",
                config.encoder,
                ffmpeg.display()
            )));
        }

        std::fs::create_dir_all(&config.output_dir)?;

        let pipe = match config.input_transport.resolve() {
            InputTransport::NamedPipe => Some(NamedPipe::create()?),
            _ => None,
        };
        let input = pipe
            .as_ref()
            .map(|p| p.path().to_string_lossy().to_string())
            .unwrap_or_else(|| "-".to_string());

        let args = build_args(config, &input);
        log::info!(
            "[ENCODER] Running: {} {}",
            ffmpeg.display(),
            args.join(" ")
        );

        let mut command = create_hidden_command(&ffmpeg);
        command.args(&args);
        Self::launch(command, pipe, config.show_ffmpeg_logs)
    }

    /// Start an already built command reading frames from `pipe`, or from its
    /// stdin when there is no pipe.
    pub fn launch(
        mut command: Command,
        pipe: Option<NamedPipe>,
        show_logs: bool,
    ) -> PipelineResult<(Self, EncoderInput)> {
        command.stdin(if pipe.is_some() {
            Stdio::null()
        } else {
            Stdio::piped()
        });
        if show_logs {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = command
            .spawn()
            .map_err(|e| PipelineError::EncoderStart(e.to_string()))?;

        let input: PipelineResult<EncoderInput> = match &pipe {
            Some(pipe) => pipe
                .open_writer(&mut child)
                .map(|file| Box::new(file) as EncoderInput),
            None => child
                .stdin
                .take()
                .context("encoder stdin was not captured")
                .map(|stdin| Box::new(stdin) as EncoderInput),
        };

        match input {
            Ok(input) => {
                log::debug!("[ENCODER] Started encoder process {}", child.id());
                Ok((Self { child, pipe }, input))
            },
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the encoder to exit. The input must already be closed.
    ///
    /// A non-zero exit is logged, not returned as an error: every frame has
    /// already been handed over by then.
    pub fn finish(mut self) -> PipelineResult<ExitStatus> {
        let status = self.child.wait()?;
        if status.success() {
            log::info!("[ENCODER] Encoder finished");
        } else {
            log::warn!("[ENCODER] Encoder exited with {}", status);
        }
        drop(self.pipe.take());
        Ok(status)
    }

    /// Kill the encoder without waiting for it to finish the file.
    pub fn abort(mut self) {
        log::warn!("[ENCODER] Killing encoder process {}", self.child.id());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
