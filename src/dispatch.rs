//! Batch and daemon dispatch loops
//!
//! Both modes share the same per-job path: build a request, run it through
//! the completion bridge, serialize the response. Batch mode walks an
//! externally supplied list of URIs; daemon mode reads requests from the
//! transport until the peer closes it.
//!
//! Responses are always produced and written in the order requests were
//! read or enumerated: the bridge is invoked strictly sequentially, so
//! there is no reordering.

use crate::bridge::run_job;
use crate::engine::JobEngine;
use crate::message::{JobKind, OutputSpec, ParseOptions, Request, SeekSpec};
use crate::metrics::Metrics;
use crate::serdes::{Serdes, WireError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// The fixed per-uri execution order in batch mode.
const KIND_ORDER: [JobKind; 3] = [JobKind::Parse, JobKind::Thumbnail, JobKind::ThumbnailToFiles];

/// One batch work item: a uri and the kinds requested for it
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub uri: String,
    pub kinds: Vec<JobKind>,
}

/// Option state shared by every batch request
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub parse: ParseOptions,
    pub seek: SeekSpec,
    pub hw_decode: bool,
    pub outputs: Vec<OutputSpec>,
}

impl BatchOptions {
    fn request_for(&self, kind: JobKind, uri: &str) -> Request {
        Request {
            kind,
            uri: uri.to_string(),
            parse: self.parse,
            seek: self.seek,
            hw_decode: self.hw_decode,
            outputs: match kind {
                JobKind::ThumbnailToFiles => self.outputs.clone(),
                _ => Vec::new(),
            },
        }
    }
}

/// Drives jobs through the engine one at a time and frames the responses
pub struct Dispatcher<'e> {
    engine: &'e dyn JobEngine,
    metrics: Arc<Metrics>,
}

impl<'e> Dispatcher<'e> {
    pub fn new(engine: &'e dyn JobEngine) -> Self {
        Self {
            engine,
            metrics: Metrics::new(),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    fn run_one(&self, request: &Request) -> crate::message::Response {
        let started = Instant::now();
        let response = run_job(self.engine, request);
        self.metrics.record_job(
            request.kind,
            response.status.is_success(),
            started.elapsed().as_millis() as u64,
        );
        response
    }

    /// Process a finite list of URIs, writing every response to the sink.
    ///
    /// A failed kind stops the remaining kinds for that uri; later uris
    /// still run. Returns whether every job succeeded.
    pub fn run_batch(
        &self,
        serdes: &mut Serdes,
        jobs: &[BatchJob],
        options: &BatchOptions,
    ) -> bool {
        let mut all_ok = true;

        for job in jobs {
            for kind in KIND_ORDER {
                if !job.kinds.contains(&kind) {
                    continue;
                }
                let request = options.request_for(kind, &job.uri);
                debug!(uri = %job.uri, ?kind, "running batch job");
                let response = self.run_one(&request);
                let ok = response.status.is_success();
                if !ok {
                    error!(uri = %job.uri, ?kind, status = ?response.status, "job failed");
                    all_ok = false;
                }
                if let Err(err) = serdes.write_response(&response) {
                    // Output for this uri is gone; move on to the next one.
                    error!(uri = %job.uri, %err, "failed to write response");
                    all_ok = false;
                    break;
                }
                if !ok {
                    break;
                }
            }
        }

        all_ok
    }

    /// Serve requests from the transport until it closes or fails.
    ///
    /// The connection is the unit of recovery: any framing or transport
    /// problem closes it, since a desynchronized stream cannot be
    /// resynchronized mid-flight. A clean peer close returns `Ok`.
    pub fn run_daemon(&self, serdes: &mut Serdes) -> Result<(), WireError> {
        loop {
            let request = match serdes.read_request() {
                Ok(request) => request,
                Err(err) if err.is_end_of_stream() => {
                    info!("peer closed the request stream");
                    return Ok(());
                }
                Err(err) => {
                    error!(%err, "request stream failed");
                    return Err(err);
                }
            };

            if request.uri.is_empty() {
                error!("request carries no uri; closing connection");
                return Err(WireError::Protocol("request carries no uri"));
            }

            debug!(kind = ?request.kind, uri = %request.uri, "dispatching request");
            let response = self.run_one(&request);

            if let Err(err) = serdes.write_response(&response) {
                error!(%err, "failed to write response; closing connection");
                return Err(err);
            }
        }
    }
}
