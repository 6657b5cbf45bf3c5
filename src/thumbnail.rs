//! Thumbnail frame decoding and output file rendering
//!
//! A thumbnail job decodes exactly one frame via ffmpeg's `image2pipe`
//! into an in-memory RGB8 picture. Thumbnail-to-files jobs then resize
//! that picture per output with SIMD resizing and encode PNG/JPEG via the
//! image crate and WEBP via direct libwebp FFI.

use crate::engine::ThumbnailArgs;
use crate::error::{MediaError, Result};
use crate::ffmpeg::MediaCommand;
use crate::message::{CreationMode, DecodedImage, ImageFileFormat, OutputSpec, SeekSpeed, SeekTarget};
use fast_image_resize as fr;
use fr::images::Image as FrImage;
use image::ImageFormat;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WEBP_QUALITY: f32 = 90.0;

/// Decode one frame at the requested seek point.
pub fn decode_frame(
    path: &Path,
    args: &ThumbnailArgs,
    deadline: Option<Duration>,
) -> Result<DecodedImage> {
    if !path.exists() {
        return Err(MediaError::Processing(format!(
            "no such file: {}",
            path.display()
        )));
    }

    // The deadline covers the whole job, so the duration probe a position
    // seek needs eats into the decode's budget.
    let started = Instant::now();
    let seek_secs = match args.seek.target {
        SeekTarget::None => None,
        SeekTarget::Time { ms } => Some(ms as f64 / 1000.0),
        SeekTarget::Position { pos } => {
            let duration = crate::metadata::probe_duration_ms(path, deadline)?.ok_or_else(|| {
                MediaError::Processing("container reports no duration for position seek".to_string())
            })?;
            Some(duration as f64 * pos.clamp(0.0, 1.0) / 1000.0)
        }
    };
    let deadline = remaining_budget(deadline, started);

    let mut cmd = MediaCommand::ffmpeg().args(&["-v", "error"]);
    if args.hw_decode {
        cmd = cmd.args(&["-hwaccel", "auto"]);
    }
    // Fast seeking happens on the input side (keyframe-accurate), precise
    // seeking on the output side (decodes up to the target frame).
    if let (Some(secs), SeekSpeed::Fast) = (seek_secs, args.seek.speed) {
        cmd = cmd.arg("-ss").arg(format!("{:.3}", secs));
    }
    cmd = cmd.input(path);
    if let (Some(secs), SeekSpeed::Precise) = (seek_secs, args.seek.speed) {
        cmd = cmd.arg("-ss").arg(format!("{:.3}", secs));
    }
    let stdout = cmd
        .args(&["-frames:v", "1", "-f", "image2pipe", "-c:v", "png", "pipe:1"])
        .run(deadline)?;

    if stdout.is_empty() {
        return Err(MediaError::Processing(
            "no frame decoded at requested position".to_string(),
        ));
    }

    let rgb = image::load_from_memory(&stdout)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    debug!(width, height, "decoded thumbnail frame");
    Ok(DecodedImage {
        width,
        height,
        pixels: rgb.into_raw(),
    })
}

/// Budget left on a wall-clock limit after time already spent.
fn remaining_budget(limit: Option<Duration>, started: Instant) -> Option<Duration> {
    limit.map(|limit| limit.saturating_sub(started.elapsed()))
}

/// Render one decoded frame into every requested output file.
///
/// Returns one bool per output, in request order. A failing output never
/// aborts the remaining ones.
pub fn render_to_files(image: &DecodedImage, outputs: &[OutputSpec]) -> Vec<bool> {
    outputs
        .iter()
        .map(|spec| match render_output(image, spec) {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %spec.path.display(), %err, "thumbnail output failed");
                false
            }
        })
        .collect()
}

fn render_output(image: &DecodedImage, spec: &OutputSpec) -> Result<()> {
    let source = if spec.crop {
        center_crop(image, spec.width, spec.height)
    } else {
        image.clone()
    };
    let resized = resize(&source, spec.width, spec.height)?;
    let encoded = encode(&resized, spec.format)?;
    write_file(&spec.path, &encoded, spec.mode)
}

/// Crop the source to the target aspect ratio around its center.
fn center_crop(image: &DecodedImage, target_w: u32, target_h: u32) -> DecodedImage {
    let src_w = image.width as u64;
    let src_h = image.height as u64;
    // Widest crop with the target aspect that fits inside the source.
    let (crop_w, crop_h) = if src_w * target_h as u64 > src_h * target_w as u64 {
        (src_h * target_w as u64 / target_h as u64, src_h)
    } else {
        (src_w, src_w * target_h as u64 / target_w as u64)
    };
    let crop_w = (crop_w as u32).max(1);
    let crop_h = (crop_h as u32).max(1);
    let left = (image.width - crop_w) / 2;
    let top = (image.height - crop_h) / 2;

    let row_bytes = crop_w as usize * 3;
    let src_stride = image.width as usize * 3;
    let mut pixels = Vec::with_capacity(row_bytes * crop_h as usize);
    for row in top..top + crop_h {
        let start = row as usize * src_stride + left as usize * 3;
        pixels.extend_from_slice(&image.pixels[start..start + row_bytes]);
    }

    DecodedImage {
        width: crop_w,
        height: crop_h,
        pixels,
    }
}

fn resize(image: &DecodedImage, width: u32, height: u32) -> Result<DecodedImage> {
    if image.width == width && image.height == height {
        return Ok(image.clone());
    }

    let src = FrImage::from_vec_u8(
        image.width,
        image.height,
        image.pixels.clone(),
        fr::PixelType::U8x3,
    )
    .map_err(|e| MediaError::Processing(format!("resize source: {:?}", e)))?;
    let mut dst = FrImage::new(width, height, src.pixel_type());

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(&src, &mut dst, None)
        .map_err(|e| MediaError::Processing(format!("resize failed: {:?}", e)))?;

    Ok(DecodedImage {
        width,
        height,
        pixels: dst.buffer().to_vec(),
    })
}

fn encode(image: &DecodedImage, format: ImageFileFormat) -> Result<Vec<u8>> {
    match format {
        ImageFileFormat::Webp => {
            // Direct libwebp FFI encoding, no subprocess and no temp files.
            let encoder = webp::Encoder::from_rgb(&image.pixels, image.width, image.height);
            Ok(encoder.encode(WEBP_QUALITY).to_vec())
        }
        ImageFileFormat::Png | ImageFileFormat::Jpeg => {
            let rgb =
                image::RgbImage::from_raw(image.width, image.height, image.pixels.clone())
                    .ok_or_else(|| {
                        MediaError::Processing("pixel buffer does not match dimensions".to_string())
                    })?;
            let format = match format {
                ImageFileFormat::Png => ImageFormat::Png,
                _ => ImageFormat::Jpeg,
            };
            let mut encoded = Vec::new();
            image::DynamicImage::ImageRgb8(rgb).write_to(&mut Cursor::new(&mut encoded), format)?;
            Ok(encoded)
        }
    }
}

fn write_file(path: &Path, data: &[u8], mode: CreationMode) -> Result<()> {
    match mode {
        CreationMode::Overwrite => std::fs::write(path, data)?,
        CreationMode::CreateNew => {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)?;
            file.write_all(data)?;
        }
    }
    Ok(())
}
