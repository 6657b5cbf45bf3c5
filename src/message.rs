//! Job request/response message model
//!
//! One `Request` describes one unit of work for a media URI; one `Response`
//! answers it. The daemon protocol carries exactly one `Response` per
//! `Request`, in order, so neither side needs a correlation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// The three job kinds a worker can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Parse,
    Thumbnail,
    ThumbnailToFiles,
}

/// What a parse job should extract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    /// Fill in container-level metadata (duration, tags, mime)
    pub metadata: bool,
    /// Extract embedded attachments (fonts, cover art)
    pub attachments: bool,
    /// Build the container/stream node tree
    pub subtree: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            metadata: true,
            attachments: false,
            subtree: true,
        }
    }
}

/// Where in the media to grab a thumbnail frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SeekTarget {
    #[default]
    None,
    Time {
        ms: u64,
    },
    /// Fraction of total duration, 0.0..=1.0
    Position {
        pos: f64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekSpeed {
    /// Keyframe-accurate input seeking (cheap)
    #[default]
    Fast,
    /// Frame-accurate output seeking (decodes up to the target)
    Precise,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekSpec {
    pub target: SeekTarget,
    pub speed: SeekSpeed,
}

/// Encoded image format for thumbnail files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFileFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFileFormat::Png => "png",
            ImageFileFormat::Jpeg => "jpg",
            ImageFileFormat::Webp => "webp",
        }
    }
}

/// How a thumbnail output file is created on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationMode {
    /// Replace the file if it already exists
    #[default]
    Overwrite,
    /// Fail the output if the file already exists
    CreateNew,
}

/// One requested thumbnail file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub width: u32,
    pub height: u32,
    pub path: PathBuf,
    pub format: ImageFileFormat,
    /// Center-crop to the target aspect ratio instead of stretching
    #[serde(default)]
    pub crop: bool,
    #[serde(default)]
    pub mode: CreationMode,
}

/// One unit of work for a media URI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub kind: JobKind,
    pub uri: String,
    #[serde(default)]
    pub parse: ParseOptions,
    #[serde(default)]
    pub seek: SeekSpec,
    #[serde(default)]
    pub hw_decode: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputSpec>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request uri is empty")]
    EmptyUri,
    #[error("thumbnail_to_files request has no outputs")]
    NoOutputs,
    #[error("outputs are only valid for thumbnail_to_files requests")]
    UnexpectedOutputs,
}

impl Request {
    /// Reject malformed requests before they reach the engine.
    ///
    /// Invariant: `outputs` is non-empty exactly when the kind is
    /// `ThumbnailToFiles`.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.uri.is_empty() {
            return Err(RequestError::EmptyUri);
        }
        match self.kind {
            JobKind::ThumbnailToFiles if self.outputs.is_empty() => Err(RequestError::NoOutputs),
            JobKind::Parse | JobKind::Thumbnail if !self.outputs.is_empty() => {
                Err(RequestError::UnexpectedOutputs)
            }
            _ => Ok(()),
        }
    }
}

/// Terminal status of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    /// Rejected before submission (empty uri, missing outputs)
    InvalidRequest,
    /// The engine refused to accept the job
    Rejected,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn is_success(self) -> bool {
        matches!(self, JobStatus::Success)
    }
}

/// Container-level metadata for one media item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub uri: String,
    pub container: Option<String>,
    pub mime: Option<String>,
    pub duration_ms: Option<u64>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl ItemMetadata {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }
}

/// An embedded attachment (font, cover art) pulled out of a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Container,
    Video,
    Audio,
    Subtitle,
    Attachment,
    Data,
}

/// One node of the container/stream tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamNode {
    pub kind: StreamKind,
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StreamNode>,
}

impl StreamNode {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            codec: None,
            details: BTreeMap::new(),
            children: Vec::new(),
        }
    }
}

/// A decoded RGB8 picture, row-major, no padding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Kind-specific result payload, exactly one variant per `JobKind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum ResponseBody {
    Parse {
        metadata: Option<ItemMetadata>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        subtree: Option<StreamNode>,
    },
    Thumbnail {
        image: Option<DecodedImage>,
    },
    ThumbnailToFiles {
        #[serde(default)]
        per_output: Vec<bool>,
    },
}

/// The answer to exactly one `Request`, produced even on failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl Response {
    /// Zero-valued response pre-tagged with `kind`, ready for the
    /// completion callbacks to fill in.
    pub fn new_for(kind: JobKind) -> Self {
        let body = match kind {
            JobKind::Parse => ResponseBody::Parse {
                metadata: None,
                attachments: Vec::new(),
                subtree: None,
            },
            JobKind::Thumbnail => ResponseBody::Thumbnail { image: None },
            JobKind::ThumbnailToFiles => ResponseBody::ThumbnailToFiles {
                per_output: Vec::new(),
            },
        };
        Self {
            kind,
            status: JobStatus::Failed,
            body,
        }
    }

    /// Ready-made failure response for requests that never ran.
    pub fn failure(kind: JobKind, status: JobStatus) -> Self {
        let mut response = Self::new_for(kind);
        response.status = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thumbnail_request(uri: &str) -> Request {
        Request {
            kind: JobKind::Thumbnail,
            uri: uri.to_string(),
            parse: ParseOptions::default(),
            seek: SeekSpec::default(),
            hw_decode: false,
            outputs: Vec::new(),
        }
    }

    #[test]
    fn empty_uri_is_rejected() {
        let request = thumbnail_request("");
        assert_eq!(request.validate(), Err(RequestError::EmptyUri));
    }

    #[test]
    fn thumbnail_to_files_needs_outputs() {
        let mut request = thumbnail_request("file:///clip.mp4");
        request.kind = JobKind::ThumbnailToFiles;
        assert_eq!(request.validate(), Err(RequestError::NoOutputs));

        request.outputs.push(OutputSpec {
            width: 320,
            height: 180,
            path: PathBuf::from("/tmp/thumb.png"),
            format: ImageFileFormat::Png,
            crop: false,
            mode: CreationMode::Overwrite,
        });
        assert_eq!(request.validate(), Ok(()));
    }

    #[test]
    fn outputs_on_other_kinds_are_rejected() {
        let mut request = thumbnail_request("file:///clip.mp4");
        request.outputs.push(OutputSpec {
            width: 1,
            height: 1,
            path: PathBuf::from("/tmp/x.png"),
            format: ImageFileFormat::Png,
            crop: false,
            mode: CreationMode::Overwrite,
        });
        assert_eq!(request.validate(), Err(RequestError::UnexpectedOutputs));
    }

    #[test]
    fn new_for_matches_kind() {
        let parse = Response::new_for(JobKind::Parse);
        assert_eq!(parse.kind, JobKind::Parse);
        assert!(matches!(
            parse.body,
            ResponseBody::Parse { metadata: None, ref attachments, subtree: None }
                if attachments.is_empty()
        ));

        let thumb = Response::new_for(JobKind::Thumbnail);
        assert!(matches!(thumb.body, ResponseBody::Thumbnail { image: None }));

        let files = Response::new_for(JobKind::ThumbnailToFiles);
        assert!(matches!(
            files.body,
            ResponseBody::ThumbnailToFiles { ref per_output } if per_output.is_empty()
        ));
    }

    #[test]
    fn request_json_round_trip() {
        let mut request = thumbnail_request("file:///clip.mp4");
        request.seek = SeekSpec {
            target: SeekTarget::Time { ms: 5000 },
            speed: SeekSpeed::Precise,
        };
        request.hw_decode = true;

        let bytes = serde_json::to_vec(&request).unwrap();
        let decoded: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn request_defaults_apply_when_fields_absent() {
        let decoded: Request =
            serde_json::from_str(r#"{"kind":"parse","uri":"file:///a.mkv"}"#).unwrap();
        assert_eq!(decoded.kind, JobKind::Parse);
        assert_eq!(decoded.parse, ParseOptions::default());
        assert_eq!(decoded.seek.target, SeekTarget::None);
        assert!(!decoded.hw_decode);
        assert!(decoded.outputs.is_empty());
    }

    #[test]
    fn response_json_round_trip_with_empty_sequences() {
        let response = Response::new_for(JobKind::Parse);
        let bytes = serde_json::to_vec(&response).unwrap();
        let decoded: Response = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, response);

        let mut files = Response::new_for(JobKind::ThumbnailToFiles);
        files.status = JobStatus::Success;
        if let ResponseBody::ThumbnailToFiles { per_output } = &mut files.body {
            per_output.extend([true, false, true]);
        }
        let bytes = serde_json::to_vec(&files).unwrap();
        let decoded: Response = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, files);
    }
}
