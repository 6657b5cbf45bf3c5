//! Job engine facade and the ffmpeg-backed implementation
//!
//! The dispatch side only ever sees the [`JobEngine`] trait: submit a job
//! with a callback bundle, get back a cancellation-free handle (or `None`
//! when the engine cannot accept work). Every callback fires on an
//! engine-owned thread, never on the submitting thread, and each accepted
//! job invokes its terminal callback exactly once.

use crate::error::{MediaError, Result};
use crate::message::{
    Attachment, DecodedImage, ItemMetadata, JobStatus, OutputSpec, ParseOptions, SeekSpec,
    StreamNode,
};
use crate::{metadata, thumbnail};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Seek and decode parameters shared by both thumbnail kinds
#[derive(Debug, Clone, Copy, Default)]
pub struct ThumbnailArgs {
    pub seek: SeekSpec,
    pub hw_decode: bool,
}

/// Callback bundle for a parse job.
///
/// `on_attachments_added` may fire any number of times and
/// `on_subtree_added` at most once, all before `on_ended`.
pub struct ParseCallbacks {
    pub on_attachments_added: Box<dyn FnMut(Vec<Attachment>) + Send>,
    pub on_subtree_added: Box<dyn FnOnce(StreamNode) + Send>,
    pub on_ended: Box<dyn FnOnce(JobStatus, Option<ItemMetadata>) + Send>,
}

/// Callback bundle for a thumbnail job; the picture is present iff the
/// status is success.
pub struct ThumbnailCallbacks {
    pub on_ended: Box<dyn FnOnce(JobStatus, Option<DecodedImage>) + Send>,
}

/// Callback bundle for a thumbnail-to-files job; one bool per requested
/// output, in request order.
pub struct ThumbnailFilesCallbacks {
    pub on_ended: Box<dyn FnOnce(JobStatus, Vec<bool>) + Send>,
}

/// Caller's reference to an in-flight job. Dropping or releasing it never
/// cancels the job.
pub struct JobHandle {
    _task: Option<tokio::task::JoinHandle<()>>,
}

impl JobHandle {
    /// Handle for engines that track their jobs elsewhere.
    pub fn detached() -> Self {
        Self { _task: None }
    }

    pub fn from_task(task: tokio::task::JoinHandle<()>) -> Self {
        Self { _task: Some(task) }
    }
}

/// The asynchronous preprocessing engine, as consumed by the dispatch side
pub trait JobEngine: Send + Sync {
    fn submit_parse(
        &self,
        item: ItemMetadata,
        options: &ParseOptions,
        callbacks: ParseCallbacks,
    ) -> Option<JobHandle>;

    fn submit_thumbnail(
        &self,
        item: ItemMetadata,
        args: &ThumbnailArgs,
        callbacks: ThumbnailCallbacks,
    ) -> Option<JobHandle>;

    fn submit_thumbnail_to_files(
        &self,
        item: ItemMetadata,
        args: &ThumbnailArgs,
        outputs: Vec<OutputSpec>,
        callbacks: ThumbnailFilesCallbacks,
    ) -> Option<JobHandle>;

    /// Release the caller's reference to a job without cancelling it.
    fn release(&self, handle: JobHandle) {
        drop(handle);
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Wall-clock limit per job; exceeding it fails the job with a
    /// timeout status.
    pub job_timeout: Option<Duration>,
}

/// Engine that shells out to the system ffmpeg/ffprobe on an internal
/// tokio runtime
pub struct FfmpegEngine {
    runtime: tokio::runtime::Runtime,
    config: EngineConfig,
    accepting: AtomicBool,
}

impl FfmpegEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("mediaprep-engine")
            .enable_time()
            .build()
            .map_err(|e| MediaError::Engine(e.to_string()))?;
        Ok(Self {
            runtime,
            config,
            accepting: AtomicBool::new(true),
        })
    }

    /// Stop accepting new jobs; in-flight jobs still run to completion.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

impl JobEngine for FfmpegEngine {
    fn submit_parse(
        &self,
        item: ItemMetadata,
        options: &ParseOptions,
        callbacks: ParseCallbacks,
    ) -> Option<JobHandle> {
        if !self.accepting() {
            return None;
        }
        let options = *options;
        let timeout = self.config.job_timeout;
        let task = self.runtime.spawn_blocking(move || {
            debug!(uri = %item.uri, "parse job started");
            let ParseCallbacks {
                mut on_attachments_added,
                on_subtree_added,
                on_ended,
            } = callbacks;
            match metadata::parse_item(item, &options, timeout) {
                Ok(parsed) => {
                    if !parsed.attachments.is_empty() {
                        on_attachments_added(parsed.attachments);
                    }
                    if let Some(subtree) = parsed.subtree {
                        on_subtree_added(subtree);
                    }
                    on_ended(JobStatus::Success, Some(parsed.metadata));
                }
                Err(err) => {
                    warn!(%err, "parse job failed");
                    on_ended(err.status(), None);
                }
            }
        });
        Some(JobHandle::from_task(task))
    }

    fn submit_thumbnail(
        &self,
        item: ItemMetadata,
        args: &ThumbnailArgs,
        callbacks: ThumbnailCallbacks,
    ) -> Option<JobHandle> {
        if !self.accepting() {
            return None;
        }
        let args = *args;
        let timeout = self.config.job_timeout;
        let task = self.runtime.spawn_blocking(move || {
            debug!(uri = %item.uri, "thumbnail job started");
            match thumbnail::decode_frame(&local_path(&item.uri), &args, timeout) {
                Ok(image) => (callbacks.on_ended)(JobStatus::Success, Some(image)),
                Err(err) => {
                    warn!(%err, "thumbnail job failed");
                    (callbacks.on_ended)(err.status(), None);
                }
            }
        });
        Some(JobHandle::from_task(task))
    }

    fn submit_thumbnail_to_files(
        &self,
        item: ItemMetadata,
        args: &ThumbnailArgs,
        outputs: Vec<OutputSpec>,
        callbacks: ThumbnailFilesCallbacks,
    ) -> Option<JobHandle> {
        if !self.accepting() {
            return None;
        }
        let args = *args;
        let timeout = self.config.job_timeout;
        let task = self.runtime.spawn_blocking(move || {
            debug!(uri = %item.uri, outputs = outputs.len(), "thumbnail-to-files job started");
            match thumbnail::decode_frame(&local_path(&item.uri), &args, timeout) {
                Ok(image) => {
                    let per_output = thumbnail::render_to_files(&image, &outputs);
                    (callbacks.on_ended)(JobStatus::Success, per_output);
                }
                Err(err) => {
                    warn!(%err, "thumbnail-to-files decode failed");
                    (callbacks.on_ended)(err.status(), vec![false; outputs.len()]);
                }
            }
        });
        Some(JobHandle::from_task(task))
    }
}

/// Map a URI onto a local filesystem path. Full URI normalization is the
/// embedding framework's job; the worker only strips the file scheme.
pub fn local_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}
