use std::fs;
use std::io::Cursor;
use std::path::Path;

use base64::Engine as _;
use color_quant::NeuQuant;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::codecs::tiff::TiffEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::{self, ColorMap, FilterType};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, Rgba, RgbaImage};
use pixelcast_contracts::images::{
    normalize_extension, EncodingOverride, EncodingParams, EncodingProfile, OutputFormat,
    SavedArtifact,
};
use pixelcast_contracts::requests::{GenerationResult, SaveOptions, SaveOutcome};
use sha2::{Digest, Sha256};

use crate::error::{BoxError, PixelcastError, Result};
use crate::BASE64;

const JPEG_DEFAULT_QUALITY: u8 = 80;
const PNG_DEFAULT_COMPRESSION: u8 = 6;
const WEBP_DEFAULT_QUALITY: u8 = 80;
const AVIF_DEFAULT_QUALITY: u8 = 50;
const AVIF_DEFAULT_EFFORT: u8 = 4;
const PALETTE_DEFAULT_COLORS: u16 = 256;

pub const NO_IMAGES_WARNING: &str = "No generated images to save.";

/// Decodes, re-encodes and writes every image of `result`. Files written before
/// a failure stay on disk.
pub fn save_images(result: &GenerationResult, options: &SaveOptions) -> Result<SaveOutcome> {
    save_images_reporting(result, options, |_| {})
}

/// [`save_images`], calling `on_saved` right after each file lands, so callers
/// still see what was written when a later image fails.
pub fn save_images_reporting(
    result: &GenerationResult,
    options: &SaveOptions,
    mut on_saved: impl FnMut(&SavedArtifact),
) -> Result<SaveOutcome> {
    if result.images.is_empty() {
        return Ok(SaveOutcome {
            artifacts: Vec::new(),
            warnings: vec![NO_IMAGES_WARNING.to_string()],
        });
    }

    let extension = normalize_extension(&options.extension);
    let format = OutputFormat::from_extension(&extension)
        .ok_or_else(|| PixelcastError::UnsupportedFormat(options.extension.clone()))?;

    fs::create_dir_all(&options.directory)
        .map_err(|err| PixelcastError::persistence(&options.directory, err))?;

    let params = resolve_params(
        format,
        options.profile.as_ref(),
        result.reference_profile.as_ref(),
    );
    let salt = time_salt();
    let total = result.images.len();
    let mut artifacts = Vec::with_capacity(total);

    for (index, payload) in result.images.iter().enumerate() {
        let stem = file_stem(options.filename.as_deref(), index, total, &result.prompt, salt);
        let path = options.directory.join(format!("{stem}.{extension}"));

        let bytes = BASE64
            .decode(payload.data.as_bytes())
            .map_err(|err| PixelcastError::persistence(&path, err))?;
        let decoded =
            image::load_from_memory(&bytes).map_err(|err| PixelcastError::persistence(&path, err))?;
        let resized = apply_resize(decoded, options.profile.as_ref());
        let encoded = encode_image(&resized, format, params)
            .map_err(|err| PixelcastError::persistence(&path, err))?;
        write_file(&path, &encoded)?;

        let artifact = SavedArtifact {
            path,
            profile: EncodingProfile {
                format,
                width: resized.width(),
                height: resized.height(),
                params,
            },
        };
        on_saved(&artifact);
        artifacts.push(artifact);
    }

    Ok(SaveOutcome {
        artifacts,
        warnings: Vec::new(),
    })
}

/// Explicit override, else the inferred profile when it targets the same
/// format, else the format's defaults.
pub fn resolve_params(
    format: OutputFormat,
    explicit: Option<&EncodingOverride>,
    inferred: Option<&EncodingProfile>,
) -> EncodingParams {
    if let Some(explicit) = explicit {
        return params_from_override(format, explicit);
    }
    match inferred {
        Some(profile) if profile.format == format => profile.params,
        _ => default_params(format),
    }
}

pub fn default_params(format: OutputFormat) -> EncodingParams {
    params_from_override(format, &EncodingOverride::default())
}

fn params_from_override(format: OutputFormat, explicit: &EncodingOverride) -> EncodingParams {
    let quality = |default: u8| explicit.quality.unwrap_or(default).min(100);
    match format {
        OutputFormat::Jpeg => EncodingParams::Lossy {
            quality: quality(JPEG_DEFAULT_QUALITY),
            effort: None,
        },
        OutputFormat::Avif => EncodingParams::Lossy {
            quality: quality(AVIF_DEFAULT_QUALITY),
            effort: Some(explicit.effort.unwrap_or(AVIF_DEFAULT_EFFORT).min(9)),
        },
        OutputFormat::Webp => EncodingParams::NearLossless {
            quality: quality(WEBP_DEFAULT_QUALITY),
        },
        OutputFormat::Png => {
            let compression_level = explicit
                .compression_level
                .unwrap_or(PNG_DEFAULT_COMPRESSION)
                .min(9);
            if explicit.palette.unwrap_or(explicit.colors.is_some()) {
                EncodingParams::LosslessPalette {
                    colors: explicit
                        .colors
                        .unwrap_or(PALETTE_DEFAULT_COLORS)
                        .clamp(2, 256),
                    quality: quality(100),
                    dither: explicit.dither.unwrap_or(true),
                    compression_level,
                }
            } else {
                EncodingParams::LosslessTrueColor { compression_level }
            }
        }
        // The TIFF encoder has no compression knob.
        OutputFormat::Tiff => EncodingParams::LosslessTrueColor {
            compression_level: 0,
        },
    }
}

/// Caller stem as-is for a single image, `{stem}_{index}` for several; without a
/// stem, a salted content hash.
pub fn file_stem(
    filename: Option<&str>,
    index: usize,
    total: usize,
    prompt: &str,
    salt: i64,
) -> String {
    match filename.map(str::trim).filter(|stem| !stem.is_empty()) {
        Some(stem) if total == 1 => stem.to_string(),
        Some(stem) => format!("{stem}_{index}"),
        None => salted_hash_stem(prompt, index, salt),
    }
}

/// Identical prompts in different saves get different names because of the salt.
pub fn salted_hash_stem(prompt: &str, index: usize, salt: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{prompt}_{index}_{salt}").as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn time_salt() -> i64 {
    let now = chrono::Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros())
}

fn apply_resize(image: DynamicImage, explicit: Option<&EncodingOverride>) -> DynamicImage {
    let Some(explicit) = explicit else {
        return image;
    };
    let (width, height) = (image.width(), image.height());
    let target = match (explicit.width, explicit.height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, scale_side(height, w, width)),
        (None, Some(h)) => (scale_side(width, h, height), h),
        (None, None) => return image,
    };
    if target.0 == 0 || target.1 == 0 || target == (width, height) {
        return image;
    }
    image.resize_exact(target.0, target.1, FilterType::Lanczos3)
}

fn scale_side(side: u32, new_other: u32, old_other: u32) -> u32 {
    if old_other == 0 {
        return side;
    }
    ((side as f64 * new_other as f64 / old_other as f64).round() as u32).max(1)
}

fn encode_image(
    image: &DynamicImage,
    format: OutputFormat,
    params: EncodingParams,
) -> std::result::Result<Vec<u8>, BoxError> {
    let mut out = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            let rgb = image.to_rgb8();
            let quality = params.quality().unwrap_or(JPEG_DEFAULT_QUALITY).clamp(1, 100);
            JpegEncoder::new_with_quality(&mut out, quality).write_image(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                ExtendedColorType::Rgb8,
            )?;
        }
        OutputFormat::Png => {
            let level = params
                .compression_level()
                .unwrap_or(PNG_DEFAULT_COMPRESSION);
            let encoder = PngEncoder::new_with_quality(
                &mut out,
                png_compression(level),
                PngFilterType::Adaptive,
            );
            match params {
                EncodingParams::LosslessPalette {
                    colors,
                    quality,
                    dither,
                    ..
                } => {
                    let quantized = quantize(image, colors, quality, dither);
                    encoder.write_image(
                        quantized.as_raw(),
                        quantized.width(),
                        quantized.height(),
                        ExtendedColorType::Rgba8,
                    )?;
                }
                _ => eight_bit(image).write_with_encoder(encoder)?,
            }
        }
        OutputFormat::Webp => {
            // Only a lossless WebP encoder is available; quality is recorded, not applied.
            eight_bit(image).write_with_encoder(WebPEncoder::new_lossless(&mut out))?;
        }
        OutputFormat::Avif => {
            let quality = params.quality().unwrap_or(AVIF_DEFAULT_QUALITY).clamp(1, 100);
            let effort = match params {
                EncodingParams::Lossy {
                    effort: Some(effort),
                    ..
                } => effort,
                _ => AVIF_DEFAULT_EFFORT,
            };
            let speed = 10u8.saturating_sub(effort).clamp(1, 10);
            eight_bit(image)
                .write_with_encoder(AvifEncoder::new_with_speed_quality(&mut out, speed, quality))?;
        }
        OutputFormat::Tiff => {
            eight_bit(image).write_with_encoder(TiffEncoder::new(Cursor::new(&mut out)))?;
        }
    }
    Ok(out)
}

fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

fn eight_bit(image: &DynamicImage) -> DynamicImage {
    if image.color().has_alpha() {
        DynamicImage::ImageRgba8(image.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    }
}

struct QuantizedPalette(NeuQuant);

impl ColorMap for QuantizedPalette {
    type Color = Rgba<u8>;

    fn index_of(&self, color: &Rgba<u8>) -> usize {
        self.0.index_of(&color.0)
    }

    fn lookup(&self, index: usize) -> Option<Rgba<u8>> {
        self.0.lookup(index).map(Rgba)
    }

    fn has_lookup(&self) -> bool {
        true
    }

    fn map_color(&self, color: &mut Rgba<u8>) {
        self.0.map_pixel(&mut color.0);
    }
}

/// Reduces to at most `colors` entries. Quality trades NeuQuant sampling speed
/// for accuracy (100 samples every pixel).
fn quantize(image: &DynamicImage, colors: u16, quality: u8, dither: bool) -> RgbaImage {
    let mut rgba = image.to_rgba8();
    let sample_factor = 1 + (100 - i32::from(quality.min(100))) * 29 / 100;
    let palette = QuantizedPalette(NeuQuant::new(
        sample_factor,
        usize::from(colors.clamp(2, 256)),
        rgba.as_raw(),
    ));
    // Error diffusion in `imageops::dither` needs at least two columns.
    if dither && rgba.width() >= 2 {
        imageops::dither(&mut rgba, &palette);
    } else {
        for pixel in rgba.pixels_mut() {
            palette.map_color(pixel);
        }
    }
    rgba
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|err| PixelcastError::persistence(path, err))
}
