//! Completion bridge: blocking dispatch over the async engine
//!
//! [`run_job`] turns the engine's callback-driven completion protocol into
//! one blocking call that returns a fully populated [`Response`]. The
//! in-progress response is owned by a single `run_job` activation; the
//! engine's callbacks fill it in from their own threads, and a one-shot
//! signal releases the dispatch thread once the terminal callback fires.
//!
//! `run_job` is invoked strictly one-at-a-time by both dispatch loops, so
//! there is at most one in-flight job. The wire protocol has no
//! correlation id; multiplexing would need one before this could run
//! concurrently.

use crate::engine::{
    JobEngine, ParseCallbacks, ThumbnailArgs, ThumbnailCallbacks, ThumbnailFilesCallbacks,
};
use crate::message::{ItemMetadata, JobKind, JobStatus, Request, Response, ResponseBody};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, warn};

/// Run one job to completion, blocking until its terminal callback fires.
///
/// Malformed requests and engine rejections produce a failure response
/// without any wait; every path yields exactly one response.
pub fn run_job(engine: &dyn JobEngine, request: &Request) -> Response {
    if let Err(err) = request.validate() {
        warn!(kind = ?request.kind, uri = %request.uri, %err, "rejecting malformed request");
        return Response::failure(request.kind, JobStatus::InvalidRequest);
    }

    let pending = Arc::new(Mutex::new(Response::new_for(request.kind)));
    let (done, wait) = std::sync::mpsc::sync_channel::<()>(1);

    let handle = match request.kind {
        JobKind::Parse => submit_parse(engine, request, &pending, done),
        JobKind::Thumbnail => submit_thumbnail(engine, request, &pending, done),
        JobKind::ThumbnailToFiles => submit_thumbnail_to_files(engine, request, &pending, done),
    };

    let Some(handle) = handle else {
        warn!(kind = ?request.kind, uri = %request.uri, "engine rejected submission");
        return Response::failure(request.kind, JobStatus::Rejected);
    };

    // The only blocking point on the dispatch thread. The sender lives
    // solely inside the terminal callback, so a recv error means the
    // engine dropped the job without ever completing it.
    if wait.recv().is_err() {
        error!(kind = ?request.kind, uri = %request.uri, "engine dropped job without terminal callback");
        engine.release(handle);
        return Response::failure(request.kind, JobStatus::Failed);
    }
    engine.release(handle);

    let mut finished = lock(&pending);
    std::mem::replace(&mut *finished, Response::new_for(request.kind))
}

fn lock(pending: &Arc<Mutex<Response>>) -> MutexGuard<'_, Response> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn submit_parse(
    engine: &dyn JobEngine,
    request: &Request,
    pending: &Arc<Mutex<Response>>,
    done: SyncSender<()>,
) -> Option<crate::engine::JobHandle> {
    let attachments_slot = Arc::clone(pending);
    let subtree_slot = Arc::clone(pending);
    let terminal_slot = Arc::clone(pending);

    let callbacks = ParseCallbacks {
        on_attachments_added: Box::new(move |items| {
            let mut response = lock(&attachments_slot);
            if let ResponseBody::Parse { attachments, .. } = &mut response.body {
                attachments.extend(items);
            }
        }),
        on_subtree_added: Box::new(move |node| {
            let mut response = lock(&subtree_slot);
            if let ResponseBody::Parse { subtree, .. } = &mut response.body {
                *subtree = Some(node);
            }
        }),
        on_ended: Box::new(move |status, item| {
            let mut response = lock(&terminal_slot);
            response.status = status;
            if let ResponseBody::Parse { metadata, .. } = &mut response.body {
                *metadata = item;
            }
            drop(response);
            let _ = done.send(());
        }),
    };

    engine.submit_parse(ItemMetadata::new(&request.uri), &request.parse, callbacks)
}

fn submit_thumbnail(
    engine: &dyn JobEngine,
    request: &Request,
    pending: &Arc<Mutex<Response>>,
    done: SyncSender<()>,
) -> Option<crate::engine::JobHandle> {
    let terminal_slot = Arc::clone(pending);
    let callbacks = ThumbnailCallbacks {
        on_ended: Box::new(move |status, picture| {
            let mut response = lock(&terminal_slot);
            response.status = status;
            if let ResponseBody::Thumbnail { image } = &mut response.body {
                *image = picture;
            }
            drop(response);
            let _ = done.send(());
        }),
    };

    let args = ThumbnailArgs {
        seek: request.seek,
        hw_decode: request.hw_decode,
    };
    engine.submit_thumbnail(ItemMetadata::new(&request.uri), &args, callbacks)
}

fn submit_thumbnail_to_files(
    engine: &dyn JobEngine,
    request: &Request,
    pending: &Arc<Mutex<Response>>,
    done: SyncSender<()>,
) -> Option<crate::engine::JobHandle> {
    let terminal_slot = Arc::clone(pending);
    let callbacks = ThumbnailFilesCallbacks {
        on_ended: Box::new(move |status, results| {
            let mut response = lock(&terminal_slot);
            response.status = status;
            if let ResponseBody::ThumbnailToFiles { per_output } = &mut response.body {
                *per_output = results;
            }
            drop(response);
            let _ = done.send(());
        }),
    };

    let args = ThumbnailArgs {
        seek: request.seek,
        hw_decode: request.hw_decode,
    };
    engine.submit_thumbnail_to_files(
        ItemMetadata::new(&request.uri),
        &args,
        request.outputs.clone(),
        callbacks,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::doubles::ScriptedEngine;
    use crate::engine::JobHandle;
    use crate::message::{
        Attachment, CreationMode, DecodedImage, ImageFileFormat, OutputSpec, ParseOptions,
        SeekSpec, SeekSpeed, SeekTarget, StreamKind, StreamNode,
    };
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn request(kind: JobKind, uri: &str) -> Request {
        Request {
            kind,
            uri: uri.to_string(),
            parse: ParseOptions::default(),
            seek: SeekSpec::default(),
            hw_decode: false,
            outputs: Vec::new(),
        }
    }

    fn output(path: &str) -> OutputSpec {
        OutputSpec {
            width: 64,
            height: 64,
            path: PathBuf::from(path),
            format: ImageFileFormat::Png,
            crop: false,
            mode: CreationMode::Overwrite,
        }
    }

    #[test]
    fn empty_uri_never_reaches_the_engine() {
        let engine = ScriptedEngine::default();
        let response = run_job(&engine, &request(JobKind::Thumbnail, ""));

        assert_eq!(response.status, JobStatus::InvalidRequest);
        assert_eq!(response.kind, JobKind::Thumbnail);
        assert_eq!(engine.submission_count(), 0);
    }

    #[test]
    fn thumbnail_to_files_without_outputs_never_reaches_the_engine() {
        let engine = ScriptedEngine::default();
        let response = run_job(&engine, &request(JobKind::ThumbnailToFiles, "file:///clip.mp4"));

        assert_eq!(response.status, JobStatus::InvalidRequest);
        assert_eq!(engine.submission_count(), 0);
    }

    #[test]
    fn engine_rejection_synthesizes_failure_without_waiting() {
        let engine = ScriptedEngine {
            reject: true,
            ..Default::default()
        };
        let response = run_job(&engine, &request(JobKind::Parse, "file:///clip.mp4"));

        assert_eq!(response.status, JobStatus::Rejected);
        assert_eq!(engine.submission_count(), 1);
        assert_eq!(engine.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn immediate_thumbnail_success_carries_the_picture() {
        let picture = DecodedImage {
            width: 2,
            height: 1,
            pixels: vec![1, 2, 3, 4, 5, 6],
        };
        let engine = ScriptedEngine {
            image: Some(picture.clone()),
            ..Default::default()
        };

        let mut req = request(JobKind::Thumbnail, "file:///clip.mp4");
        req.seek = SeekSpec {
            target: SeekTarget::Time { ms: 5000 },
            speed: SeekSpeed::Fast,
        };
        let response = run_job(&engine, &req);

        assert_eq!(response.kind, JobKind::Thumbnail);
        assert_eq!(response.status, JobStatus::Success);
        assert_eq!(response.body, ResponseBody::Thumbnail { image: Some(picture) });
        assert_eq!(engine.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_output_results_keep_request_order() {
        let engine = ScriptedEngine {
            per_output: vec![true, false, true],
            ..Default::default()
        };

        let mut req = request(JobKind::ThumbnailToFiles, "file:///clip.mp4");
        req.outputs = vec![output("/tmp/a.png"), output("/tmp/b.png"), output("/tmp/c.png")];
        let response = run_job(&engine, &req);

        assert_eq!(response.status, JobStatus::Success);
        assert_eq!(
            response.body,
            ResponseBody::ThumbnailToFiles {
                per_output: vec![true, false, true]
            }
        );
    }

    #[test]
    fn parse_accumulates_attachment_batches_and_subtree() {
        let font = Attachment {
            name: "font.ttf".to_string(),
            mime: Some("font/ttf".to_string()),
            data: vec![1, 2, 3],
        };
        let cover = Attachment {
            name: "cover.jpg".to_string(),
            mime: Some("image/jpeg".to_string()),
            data: vec![4, 5],
        };
        let engine = ScriptedEngine {
            attachment_batches: vec![vec![font.clone()], vec![cover.clone()]],
            subtree: Some(StreamNode::new(StreamKind::Container)),
            ..Default::default()
        };

        let response = run_job(&engine, &request(JobKind::Parse, "file:///movie.mkv"));

        assert_eq!(response.status, JobStatus::Success);
        let ResponseBody::Parse {
            metadata,
            attachments,
            subtree,
        } = response.body
        else {
            panic!("parse response expected");
        };
        assert_eq!(metadata.unwrap().uri, "file:///movie.mkv");
        assert_eq!(attachments, vec![font, cover]);
        assert_eq!(subtree.unwrap().kind, StreamKind::Container);
    }

    #[test]
    fn failed_job_status_is_propagated_verbatim() {
        let engine = ScriptedEngine {
            status: JobStatus::Timeout,
            ..Default::default()
        };
        let response = run_job(&engine, &request(JobKind::Thumbnail, "file:///clip.mp4"));

        assert_eq!(response.status, JobStatus::Timeout);
        assert_eq!(response.body, ResponseBody::Thumbnail { image: None });
    }

    /// Engine that fires its terminal callback from another thread after
    /// a delay, recording event order.
    struct DelayedEngine {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl crate::engine::JobEngine for DelayedEngine {
        fn submit_parse(
            &self,
            _item: ItemMetadata,
            _options: &ParseOptions,
            _callbacks: ParseCallbacks,
        ) -> Option<JobHandle> {
            unimplemented!("parse not used in this double")
        }

        fn submit_thumbnail(
            &self,
            _item: ItemMetadata,
            _args: &ThumbnailArgs,
            callbacks: ThumbnailCallbacks,
        ) -> Option<JobHandle> {
            let events = Arc::clone(&self.events);
            events.lock().unwrap().push("submit".to_string());
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                events.lock().unwrap().push("ended".to_string());
                (callbacks.on_ended)(JobStatus::Success, None);
            });
            Some(JobHandle::detached())
        }

        fn submit_thumbnail_to_files(
            &self,
            _item: ItemMetadata,
            _args: &ThumbnailArgs,
            _outputs: Vec<OutputSpec>,
            _callbacks: ThumbnailFilesCallbacks,
        ) -> Option<JobHandle> {
            unimplemented!("thumbnail_to_files not used in this double")
        }
    }

    #[test]
    fn second_job_never_starts_before_the_first_terminal_callback() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = DelayedEngine {
            events: Arc::clone(&events),
        };

        let req = request(JobKind::Thumbnail, "file:///clip.mp4");
        run_job(&engine, &req);
        run_job(&engine, &req);

        assert_eq!(
            *events.lock().unwrap(),
            vec!["submit", "ended", "submit", "ended"]
        );
    }
}
