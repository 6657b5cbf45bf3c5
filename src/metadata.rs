//! Container metadata parsing via ffprobe
//!
//! A parse job probes the container with
//! `ffprobe -print_format json -show_format -show_streams`, sniffs the
//! MIME type from the file's magic bytes, and optionally extracts embedded
//! attachments and builds the container/stream node tree.

use crate::engine::local_path;
use crate::error::{MediaError, Result};
use crate::ffmpeg::MediaCommand;
use crate::message::{Attachment, ItemMetadata, ParseOptions, StreamKind, StreamNode};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything a parse job produces
#[derive(Debug)]
pub struct ParsedItem {
    pub metadata: ItemMetadata,
    pub attachments: Vec<Attachment>,
    pub subtree: Option<StreamNode>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    sample_rate: Option<String>,
    channels: Option<u32>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

/// Run one parse job to completion.
pub fn parse_item(
    item: ItemMetadata,
    options: &ParseOptions,
    deadline: Option<Duration>,
) -> Result<ParsedItem> {
    let path = local_path(&item.uri);
    if !path.exists() {
        return Err(MediaError::Processing(format!(
            "no such file: {}",
            path.display()
        )));
    }

    let probe = probe(&path, deadline)?;
    let mut parsed = from_probe(item, options, &probe);

    if options.metadata {
        parsed.metadata.mime = sniff_mime_file(&path);
    }
    if options.attachments {
        parsed.attachments = extract_attachments(&path, &probe, deadline);
    }

    Ok(parsed)
}

/// Total duration in milliseconds, used to resolve position-based seeks.
pub fn probe_duration_ms(path: &Path, deadline: Option<Duration>) -> Result<Option<u64>> {
    let probe = probe(path, deadline)?;
    Ok(duration_ms(&probe))
}

fn probe(path: &Path, deadline: Option<Duration>) -> Result<ProbeOutput> {
    let stdout = MediaCommand::ffprobe()
        .args(&["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path.display().to_string())
        .run(deadline)?;
    serde_json::from_slice(&stdout)
        .map_err(|e| MediaError::Processing(format!("ffprobe output parse error: {}", e)))
}

/// Fill metadata and the stream tree from one probe result. Pure so tests
/// can drive it with canned ffprobe JSON.
fn from_probe(item: ItemMetadata, options: &ParseOptions, probe: &ProbeOutput) -> ParsedItem {
    let mut metadata = item;

    if options.metadata {
        if let Some(format) = &probe.format {
            metadata.container = format.format_name.clone();
            metadata.title = format.tags.get("title").cloned();
            metadata.artist = format
                .tags
                .get("artist")
                .or_else(|| format.tags.get("album_artist"))
                .cloned();
            metadata.created = format.tags.get("creation_time").and_then(|s| parse_timestamp(s));
            metadata.tags = format.tags.clone();
        }
        metadata.duration_ms = duration_ms(probe);
    }

    let subtree = options.subtree.then(|| build_subtree(probe));

    ParsedItem {
        metadata,
        attachments: Vec::new(),
        subtree,
    }
}

fn duration_ms(probe: &ProbeOutput) -> Option<u64> {
    probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|s| s.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn build_subtree(probe: &ProbeOutput) -> StreamNode {
    let mut root = StreamNode::new(StreamKind::Container);
    root.codec = probe.format.as_ref().and_then(|f| f.format_name.clone());

    for stream in &probe.streams {
        let kind = match stream.codec_type.as_deref() {
            Some("video") => StreamKind::Video,
            Some("audio") => StreamKind::Audio,
            Some("subtitle") => StreamKind::Subtitle,
            Some("attachment") => StreamKind::Attachment,
            _ => StreamKind::Data,
        };
        let mut node = StreamNode::new(kind);
        node.codec = stream.codec_name.clone();
        if let (Some(w), Some(h)) = (stream.width, stream.height) {
            node.details.insert("width".to_string(), w.to_string());
            node.details.insert("height".to_string(), h.to_string());
        }
        if let Some(rate) = &stream.sample_rate {
            node.details.insert("sample_rate".to_string(), rate.clone());
        }
        if let Some(channels) = stream.channels {
            node.details.insert("channels".to_string(), channels.to_string());
        }
        root.children.push(node);
    }

    root
}

/// Sniff the MIME type from the file's first bytes.
fn sniff_mime_file(path: &Path) -> Option<String> {
    let mut head = [0u8; 8192];
    let n = std::fs::File::open(path)
        .and_then(|mut f| f.read(&mut head))
        .ok()?;
    sniff_mime(&head[..n])
}

pub(crate) fn sniff_mime(bytes: &[u8]) -> Option<String> {
    infer::get(bytes).map(|t| t.mime_type().to_string())
}

/// The container's `filename` tag is untrusted input; reduce it to its
/// final path component so a name with separators cannot place the dump
/// outside the scratch directory.
fn attachment_file_name(tag: Option<&str>, index: usize) -> String {
    tag.map(Path::new)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("attachment-{}", index))
}

/// Dump attachment streams to a scratch directory and read them back.
fn extract_attachments(
    path: &Path,
    probe: &ProbeOutput,
    deadline: Option<Duration>,
) -> Vec<Attachment> {
    let mut attachments = Vec::new();
    let scratch = std::env::temp_dir();
    let tag = std::process::id();

    let streams = probe
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("attachment"));

    for (index, stream) in streams.enumerate() {
        let name = attachment_file_name(stream.tags.get("filename").map(String::as_str), index);
        let dump_path = scratch.join(format!("mediaprep-{}-{}-{}", tag, index, name));

        let result = MediaCommand::ffmpeg()
            .arg(format!("-dump_attachment:t:{}", index))
            .arg(dump_path.display().to_string())
            .input(path)
            .run(deadline);
        // ffmpeg exits nonzero when no output file is given even though
        // the dump succeeds, so trust the file rather than the exit code.
        if result.is_err() && !dump_path.exists() {
            warn!(%name, "attachment dump produced no file");
            continue;
        }

        match std::fs::read(&dump_path) {
            Ok(data) => {
                debug!(%name, bytes = data.len(), "extracted attachment");
                let mime = stream
                    .tags
                    .get("mimetype")
                    .cloned()
                    .or_else(|| sniff_mime(&data));
                attachments.push(Attachment { name, mime, data });
            }
            Err(err) => warn!(%name, %err, "failed to read dumped attachment"),
        }
        let _ = std::fs::remove_file(&dump_path);
    }

    attachments
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "format": {
            "format_name": "matroska,webm",
            "duration": "93.120000",
            "tags": {
                "title": "Big Buck Bunny",
                "artist": "Blender Foundation",
                "creation_time": "2023-01-15T10:30:00.000000Z"
            }
        },
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080},
            {"codec_type": "audio", "codec_name": "aac", "sample_rate": "48000", "channels": 2},
            {"codec_type": "subtitle", "codec_name": "subrip"},
            {"codec_type": "attachment", "codec_name": "ttf", "tags": {"filename": "font.ttf"}}
        ]
    }"#;

    fn canned_probe() -> ProbeOutput {
        serde_json::from_str(PROBE_JSON).unwrap()
    }

    #[test]
    fn probe_fills_container_metadata() {
        let item = ItemMetadata::new("file:///movie.mkv");
        let parsed = from_probe(item, &ParseOptions::default(), &canned_probe());

        let metadata = parsed.metadata;
        assert_eq!(metadata.uri, "file:///movie.mkv");
        assert_eq!(metadata.container.as_deref(), Some("matroska,webm"));
        assert_eq!(metadata.duration_ms, Some(93120));
        assert_eq!(metadata.title.as_deref(), Some("Big Buck Bunny"));
        assert_eq!(metadata.artist.as_deref(), Some("Blender Foundation"));
        assert!(metadata.created.is_some());
    }

    #[test]
    fn subtree_mirrors_stream_layout() {
        let item = ItemMetadata::new("file:///movie.mkv");
        let parsed = from_probe(item, &ParseOptions::default(), &canned_probe());

        let root = parsed.subtree.expect("subtree requested by default");
        assert_eq!(root.kind, StreamKind::Container);
        assert_eq!(root.children.len(), 4);
        assert_eq!(root.children[0].kind, StreamKind::Video);
        assert_eq!(root.children[0].codec.as_deref(), Some("h264"));
        assert_eq!(root.children[0].details.get("width").unwrap(), "1920");
        assert_eq!(root.children[1].kind, StreamKind::Audio);
        assert_eq!(root.children[1].details.get("channels").unwrap(), "2");
        assert_eq!(root.children[2].kind, StreamKind::Subtitle);
        assert_eq!(root.children[3].kind, StreamKind::Attachment);
    }

    #[test]
    fn options_gate_metadata_and_subtree() {
        let options = ParseOptions {
            metadata: false,
            attachments: false,
            subtree: false,
        };
        let item = ItemMetadata::new("file:///movie.mkv");
        let parsed = from_probe(item, &options, &canned_probe());

        assert!(parsed.subtree.is_none());
        assert!(parsed.metadata.container.is_none());
        assert!(parsed.metadata.duration_ms.is_none());
    }

    #[test]
    fn missing_file_fails_before_probing() {
        let err = parse_item(
            ItemMetadata::new("file:///definitely/not/here.mkv"),
            &ParseOptions::default(),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn attachment_names_cannot_escape_the_scratch_directory() {
        assert_eq!(
            attachment_file_name(Some("../../etc/passwd"), 0),
            "passwd"
        );
        assert_eq!(attachment_file_name(Some("fonts/arial.ttf"), 0), "arial.ttf");
        assert_eq!(attachment_file_name(Some("/tmp/evil.ttf"), 0), "evil.ttf");
        assert_eq!(attachment_file_name(Some("cover.jpg"), 0), "cover.jpg");
        // Names with no usable component fall back to an index-based one.
        assert_eq!(attachment_file_name(Some(".."), 3), "attachment-3");
        assert_eq!(attachment_file_name(None, 7), "attachment-7");
    }

    #[test]
    fn mime_sniffing_recognizes_png_magic() {
        let png_header = [
            0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13, b'I', b'H', b'D', b'R',
        ];
        assert_eq!(sniff_mime(&png_header).as_deref(), Some("image/png"));
        assert_eq!(sniff_mime(b"not an image"), None);
    }

    #[test]
    fn timestamps_parse_rfc3339_only() {
        assert!(parse_timestamp("2023-01-15T10:30:00.000000Z").is_some());
        assert!(parse_timestamp("January 15th").is_none());
    }
}
