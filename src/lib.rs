//! mediaprep - standalone media preprocessing worker
//!
//! Parses container metadata, decodes thumbnail frames, and writes
//! thumbnail files on behalf of a media framework. Runs either as a
//! one-shot batch CLI over a list of URIs or as a daemon that reads a
//! stream of job requests and writes a stream of job responses over
//! pipes or a unix socket.
//!
//! All media work shells out to the system `ffmpeg`/`ffprobe` binaries
//! (LGPL-safe, no linking).

pub mod bridge;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod serdes;
pub mod thumbnail;

pub use bridge::run_job;
pub use dispatch::{BatchJob, BatchOptions, Dispatcher};
pub use engine::{EngineConfig, FfmpegEngine, JobEngine};
pub use error::MediaError;
pub use ffmpeg::FfmpegError;
pub use message::{JobKind, JobStatus, Request, Response};
pub use serdes::{Serdes, WireError};

pub type Result<T> = std::result::Result<T, MediaError>;
