use crate::message::JobStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Engine unavailable: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] crate::ffmpeg::FfmpegError),
}

impl MediaError {
    /// Failure status this error maps to in a job response.
    pub fn status(&self) -> JobStatus {
        match self {
            MediaError::Ffmpeg(crate::ffmpeg::FfmpegError::TimedOut(_)) => JobStatus::Timeout,
            _ => JobStatus::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;
