//! Named pipe used as the encoder's input file.
//!
//! The pipe is created in the temp directory before the encoder starts and
//! removed when dropped. Its write end is opened only once the encoder has
//! opened the read end, so a child that dies during startup is detected
//! instead of blocking forever.

use std::path::{Path, PathBuf};

#[cfg(unix)]
pub use self::unix::NamedPipe;

#[cfg(not(unix))]
pub use self::unsupported::NamedPipe;

fn pipe_path() -> PathBuf {
    std::env::temp_dir().join(format!("framestream-{}.pipe", uuid::Uuid::new_v4()))
}

#[cfg(unix)]
mod unix {
    use std::ffi::CString;
    use std::fs::{self, File, OpenOptions};
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::process::Child;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{pipe_path, Path, PathBuf};
    use crate::error::{PipelineError, PipelineResult, ResultExt};

    /// How long the encoder gets to open its input.
    const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
    const OPEN_RETRY: Duration = Duration::from_millis(10);

    #[derive(Debug)]
    pub struct NamedPipe {
        path: PathBuf,
    }

    impl NamedPipe {
        pub fn create() -> PipelineResult<Self> {
            let path = pipe_path();
            let c_path = CString::new(path.as_os_str().as_bytes())
                .context("named pipe path contains a NUL byte")?;

            // SAFETY: c_path is a valid NUL-terminated string for the call's duration.
            let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
            if rc != 0 {
                return Err(io::Error::last_os_error().into());
            }

            log::debug!("[ENCODER] Created input pipe {}", path.display());
            Ok(Self { path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Open the write end once `child` has opened the read end.
        ///
        /// Fails if the child exits first or does not open the pipe in time.
        pub fn open_writer(&self, child: &mut Child) -> PipelineResult<File> {
            let deadline = Instant::now() + OPEN_TIMEOUT;

            loop {
                let attempt = OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&self.path);

                match attempt {
                    Ok(file) => {
                        set_blocking(&file)?;
                        return Ok(file);
                    },
                    // No reader yet
                    Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                        if let Some(status) = child.try_wait()? {
                            return Err(PipelineError::EncoderStart(format!(
                                "encoder exited with {} before opening its input",
                                status
                            )));
                        }
                        if Instant::now() >= deadline {
                            return Err(PipelineError::EncoderStart(format!(
                                "encoder did not open {} within {:?}",
                                self.path.display(),
                                OPEN_TIMEOUT
                            )));
                        }
                        thread::sleep(OPEN_RETRY);
                    },
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    fn set_blocking(file: &File) -> PipelineResult<()> {
        let fd = file.as_raw_fd();
        // SAFETY: fd is owned by `file` and stays open for both calls.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: as above.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    impl Drop for NamedPipe {
        fn drop(&mut self) {
            if let Err(e) = fs::remove_file(&self.path) {
                log::debug!(
                    "[ENCODER] Could not remove input pipe {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(not(unix))]
mod unsupported {
    use std::fs::File;
    use std::process::Child;

    use super::{Path, PathBuf};
    use crate::error::{PipelineError, PipelineResult};

    #[derive(Debug)]
    pub struct NamedPipe {
        path: PathBuf,
    }

    impl NamedPipe {
        pub fn create() -> PipelineResult<Self> {
            Err(PipelineError::Config(
                "named pipe input is only supported on Unix, use stdin".to_string(),
            ))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn open_writer(&self, _child: &mut Child) -> PipelineResult<File> {
            Err(PipelineError::Config(
                "named pipe input is only supported on Unix".to_string(),
            ))
        }
    }
}
