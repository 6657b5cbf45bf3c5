//! FFmpeg/FFprobe command wrapper utilities
//!
//! All media work shells out to the system `ffmpeg`/`ffprobe` binaries
//! (LGPL-safe, no linking). Commands capture stdout as bytes and support an
//! optional wall-clock deadline, after which the child is killed.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FfmpegError {
    #[error("{0} not found in system PATH")]
    NotInstalled(&'static str),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builder for one ffmpeg or ffprobe invocation
pub struct MediaCommand {
    program: &'static str,
    args: Vec<String>,
}

impl MediaCommand {
    pub fn ffmpeg() -> Self {
        Self {
            program: "ffmpeg",
            args: Vec::new(),
        }
    }

    pub fn ffprobe() -> Self {
        Self {
            program: "ffprobe",
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        self.args.push("-i".to_string());
        self.args.push(path.as_ref().display().to_string());
        self
    }

    #[cfg(test)]
    pub(crate) fn command_line(&self) -> (&'static str, &[String]) {
        (self.program, &self.args)
    }

    /// Run the command and return its stdout bytes.
    ///
    /// With a deadline set, the child is polled and killed once the
    /// deadline passes; stdout/stderr are drained on separate threads so a
    /// full pipe can never wedge the poll loop.
    pub fn run(self, deadline: Option<Duration>) -> Result<Vec<u8>, FfmpegError> {
        if !tool_installed(self.program) {
            return Err(FfmpegError::NotInstalled(self.program));
        }

        let mut child = Command::new(self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = std::thread::spawn(move || drain(stdout));
        let stderr_reader = std::thread::spawn(move || drain(stderr));

        let status = match deadline {
            None => child.wait()?,
            Some(limit) => {
                let started = Instant::now();
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if started.elapsed() >= limit {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(FfmpegError::TimedOut(limit));
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            let detail = String::from_utf8_lossy(&stderr);
            return Err(FfmpegError::ExecutionFailed(
                detail.lines().last().unwrap_or("unknown error").to_string(),
            ));
        }

        Ok(stdout)
    }
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut data = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut data);
    }
    data
}

fn tool_installed(program: &str) -> bool {
    Command::new(program)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
