// mediaprep - media preprocessing worker
// Batch CLI over a list of URIs, or a request/response daemon over
// stdio or a unix socket.

use anyhow::{bail, Context, Result};
use clap::Parser;
use mediaprep::dispatch::{BatchJob, BatchOptions, Dispatcher};
use mediaprep::engine::{EngineConfig, FfmpegEngine};
use mediaprep::message::{
    CreationMode, ImageFileFormat, JobKind, OutputSpec, ParseOptions, SeekSpec, SeekSpeed,
    SeekTarget,
};
use mediaprep::serdes::{self, Serdes};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mediaprep", version, about = "Media preprocessing worker - parse, thumbnail, thumbnail files")]
struct Args {
    /// Media URIs to process (batch mode)
    uris: Vec<String>,

    /// Read requests from the transport instead of the command line
    #[arg(long)]
    daemon: bool,

    /// Connect the transport to a unix socket instead of stdio
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Parse container metadata for each uri
    #[arg(long)]
    parse: bool,

    /// Decode one thumbnail frame for each uri
    #[arg(long)]
    thumbnail: bool,

    /// Write a thumbnail file, WIDTHxHEIGHT:PATH (repeatable)
    #[arg(long = "out", value_name = "WIDTHxHEIGHT:PATH")]
    outs: Vec<String>,

    /// Seek to this timestamp before grabbing the frame
    #[arg(long, value_name = "MS")]
    seek_time: Option<u64>,

    /// Seek to this fraction of the duration (0.0 - 1.0)
    #[arg(long, value_name = "POS", conflicts_with = "seek_time")]
    seek_position: Option<f64>,

    /// Frame-accurate seeking instead of keyframe-accurate
    #[arg(long)]
    precise_seek: bool,

    /// Let ffmpeg pick a hardware decoder
    #[arg(long)]
    hw_decode: bool,

    /// Center-crop thumbnail files to the target aspect ratio
    #[arg(long)]
    crop: bool,

    /// Image format for --out files
    #[arg(long, default_value = "png", value_name = "png|jpeg|webp")]
    format: String,

    /// Fail --out files that already exist instead of replacing them
    #[arg(long)]
    no_replace: bool,

    /// Extract embedded attachments during parse
    #[arg(long)]
    with_attachments: bool,

    /// Skip the container/stream tree during parse
    #[arg(long)]
    no_subtree: bool,

    /// Per-job engine timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

fn main() -> Result<()> {
    // Keep stdout clean for the response stream; all logging goes to
    // stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let engine = FfmpegEngine::new(EngineConfig {
        job_timeout: args.timeout.map(Duration::from_secs),
    })?;
    let dispatcher = Dispatcher::new(&engine);

    let result = if args.daemon {
        run_daemon(&args, &dispatcher)
    } else {
        run_batch(&args, &dispatcher)
    };

    engine.shutdown();
    info!(snapshot = ?dispatcher.metrics().snapshot(), "worker finished");
    result
}

fn run_daemon(args: &Args, dispatcher: &Dispatcher) -> Result<()> {
    let (read, write) = match &args.socket {
        Some(path) => serdes::unix_socket_transport(path)
            .with_context(|| format!("failed to connect to {}", path.display()))?,
        None => (serdes::stdin_read(), serdes::stdout_write()),
    };
    let mut serdes = Serdes::daemon(read, write);

    info!("serving requests");
    if let Err(err) = dispatcher.run_daemon(&mut serdes) {
        bail!("connection failed: {}", err);
    }
    Ok(())
}

fn run_batch(args: &Args, dispatcher: &Dispatcher) -> Result<()> {
    if args.uris.is_empty() {
        bail!("no uris given; pass --daemon to read requests from the transport");
    }

    let mut kinds = Vec::new();
    if args.parse {
        kinds.push(JobKind::Parse);
    }
    if args.thumbnail {
        kinds.push(JobKind::Thumbnail);
    }
    if !args.outs.is_empty() {
        kinds.push(JobKind::ThumbnailToFiles);
    }
    if kinds.is_empty() {
        kinds.push(JobKind::Parse);
    }

    let format = parse_format(&args.format)?;
    let mode = if args.no_replace {
        CreationMode::CreateNew
    } else {
        CreationMode::Overwrite
    };
    let outputs = args
        .outs
        .iter()
        .map(|spec| parse_output_spec(spec, format, args.crop, mode))
        .collect::<Result<Vec<_>>>()?;

    let options = BatchOptions {
        parse: ParseOptions {
            metadata: true,
            attachments: args.with_attachments,
            subtree: !args.no_subtree,
        },
        seek: seek_spec(args),
        hw_decode: args.hw_decode,
        outputs,
    };

    let jobs: Vec<BatchJob> = args
        .uris
        .iter()
        .map(|uri| BatchJob {
            uri: uri.clone(),
            kinds: kinds.clone(),
        })
        .collect();

    let write = match &args.socket {
        Some(path) => {
            let (_, write) = serdes::unix_socket_transport(path)
                .with_context(|| format!("failed to connect to {}", path.display()))?;
            write
        }
        None => serdes::stdout_write(),
    };
    let mut serdes = Serdes::batch(write);

    if !dispatcher.run_batch(&mut serdes, &jobs, &options) {
        bail!("one or more jobs failed");
    }
    Ok(())
}

fn seek_spec(args: &Args) -> SeekSpec {
    let target = if let Some(ms) = args.seek_time {
        SeekTarget::Time { ms }
    } else if let Some(pos) = args.seek_position {
        SeekTarget::Position { pos }
    } else {
        SeekTarget::None
    };
    SeekSpec {
        target,
        speed: if args.precise_seek {
            SeekSpeed::Precise
        } else {
            SeekSpeed::Fast
        },
    }
}

fn parse_format(value: &str) -> Result<ImageFileFormat> {
    match value.to_lowercase().as_str() {
        "png" => Ok(ImageFileFormat::Png),
        "jpg" | "jpeg" => Ok(ImageFileFormat::Jpeg),
        "webp" => Ok(ImageFileFormat::Webp),
        other => bail!("unknown image format: {}", other),
    }
}

/// Parse one `WIDTHxHEIGHT:PATH` output argument.
fn parse_output_spec(
    value: &str,
    format: ImageFileFormat,
    crop: bool,
    mode: CreationMode,
) -> Result<OutputSpec> {
    let (dims, path) = value
        .split_once(':')
        .with_context(|| format!("expected WIDTHxHEIGHT:PATH, got '{}'", value))?;
    let (width, height) = dims
        .split_once('x')
        .with_context(|| format!("expected WIDTHxHEIGHT, got '{}'", dims))?;
    let width: u32 = width
        .parse()
        .with_context(|| format!("bad width in '{}'", value))?;
    let height: u32 = height
        .parse()
        .with_context(|| format!("bad height in '{}'", value))?;
    if width == 0 || height == 0 || path.is_empty() {
        bail!("bad output spec '{}'", value);
    }
    Ok(OutputSpec {
        width,
        height,
        path: PathBuf::from(path),
        format,
        crop,
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_spec_parses_dimensions_and_path() {
        let spec = parse_output_spec(
            "640x360:/tmp/thumb.png",
            ImageFileFormat::Png,
            true,
            CreationMode::Overwrite,
        )
        .unwrap();
        assert_eq!((spec.width, spec.height), (640, 360));
        assert_eq!(spec.path, PathBuf::from("/tmp/thumb.png"));
        assert!(spec.crop);
    }

    #[test]
    fn bad_output_specs_are_rejected() {
        for bad in ["640x360", "x360:/tmp/a.png", "640x0:/tmp/a.png", "640x360:"] {
            assert!(
                parse_output_spec(bad, ImageFileFormat::Png, false, CreationMode::Overwrite)
                    .is_err(),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn format_names_map_to_formats() {
        assert_eq!(parse_format("png").unwrap(), ImageFileFormat::Png);
        assert_eq!(parse_format("JPEG").unwrap(), ImageFileFormat::Jpeg);
        assert_eq!(parse_format("jpg").unwrap(), ImageFileFormat::Jpeg);
        assert_eq!(parse_format("webp").unwrap(), ImageFileFormat::Webp);
        assert!(parse_format("avif").is_err());
    }
}
