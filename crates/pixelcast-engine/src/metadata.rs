use std::collections::HashSet;
use std::io::Cursor;

use anyhow::{bail, Context};
use image::{ImageFormat, ImageReader};
use pixelcast_contracts::images::{EncodingParams, EncodingProfile, OutputFormat};

const PNG_MAX_COMPRESSION: u8 = 9;
const PALETTE_QUALITY: u8 = 95;
const WEBP_QUALITY: u8 = 80;
const PNG_COLOR_TYPE_INDEXED: u8 = 3;

/// Best-effort guess at how a reference image was encoded, so generated output
/// can be written back with comparable fidelity. Not a measured reconstruction.
pub fn infer_profile(bytes: &[u8]) -> anyhow::Result<EncodingProfile> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed to sniff reference image")?;
    let format = reader
        .format()
        .context("unrecognised reference image format")?;
    let (width, height) = reader
        .into_dimensions()
        .context("failed to read reference image dimensions")?;
    if width == 0 || height == 0 {
        bail!("reference image has zero area ({width}x{height})");
    }

    let (format, params) = match format {
        ImageFormat::Jpeg => (
            OutputFormat::Jpeg,
            EncodingParams::Lossy {
                quality: jpeg_quality_for_density(bytes.len(), width, height),
                effort: None,
            },
        ),
        ImageFormat::Png => (OutputFormat::Png, png_params(bytes)?),
        ImageFormat::WebP => (
            OutputFormat::Webp,
            EncodingParams::NearLossless {
                quality: WEBP_QUALITY,
            },
        ),
        other => bail!("no encoding heuristics for {other:?} reference images"),
    };

    Ok(EncodingProfile {
        format,
        width,
        height,
        params,
    })
}

/// Maps compressed bytes-per-pixel onto a coarse JPEG quality bucket.
pub fn jpeg_quality_for_density(file_size: usize, width: u32, height: u32) -> u8 {
    let pixels = (width as f64) * (height as f64);
    if pixels <= 0.0 {
        return 90;
    }
    let bytes_per_pixel = file_size as f64 / pixels;
    if bytes_per_pixel < 0.15 {
        70
    } else if bytes_per_pixel < 0.30 {
        80
    } else {
        90
    }
}

fn png_params(bytes: &[u8]) -> anyhow::Result<EncodingParams> {
    let header = png_header(bytes).context("PNG is missing its IHDR chunk")?;
    if header.color_type != PNG_COLOR_TYPE_INDEXED {
        return Ok(EncodingParams::LosslessTrueColor {
            compression_level: PNG_MAX_COMPRESSION,
        });
    }

    // Indexed sources: count what is actually used, not what the palette could hold.
    let colors = count_distinct_colors(bytes)
        .unwrap_or_else(|_| 1usize << header.bit_depth.min(8));
    Ok(EncodingParams::LosslessPalette {
        colors: colors.min(256) as u16,
        quality: PALETTE_QUALITY,
        dither: true,
        compression_level: PNG_MAX_COMPRESSION,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PngHeader {
    bit_depth: u8,
    color_type: u8,
}

/// IHDR is always the first chunk: 8-byte signature, 4-byte length, `IHDR`,
/// width, height, then bit depth and colour type.
fn png_header(bytes: &[u8]) -> Option<PngHeader> {
    if bytes.len() < 26 || &bytes[12..16] != b"IHDR" {
        return None;
    }
    Some(PngHeader {
        bit_depth: bytes[24],
        color_type: bytes[25],
    })
}

fn count_distinct_colors(bytes: &[u8]) -> anyhow::Result<usize> {
    let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Png)
        .context("failed to decode PNG pixel plane")?
        .to_rgba8();
    let colors: HashSet<[u8; 4]> = decoded.pixels().map(|pixel| pixel.0).collect();
    Ok(colors.len())
}
