use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MIME_TYPE: &str = "image/png";

/// MIME types a reference image may carry; anything else collapses to [`DEFAULT_MIME_TYPE`].
pub const ALLOWED_MIME_TYPES: [&str; 4] = ["image/png", "image/jpeg", "image/gif", "image/webp"];

/// Formats the persistence layer can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
    Avif,
    Tiff,
}

impl OutputFormat {
    /// Case-insensitive, tolerates a leading dot. `jpg`/`jpeg` and `tif`/`tiff` are aliases.
    pub fn from_extension(raw: &str) -> Option<Self> {
        match normalize_extension(raw).as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            "tif" | "tiff" => Some(Self::Tiff),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Avif => "image/avif",
            Self::Tiff => "image/tiff",
        }
    }
}

pub fn normalize_extension(raw: &str) -> String {
    raw.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Format-specific encoder settings. Each variant carries only the knobs that
/// apply to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncodingParams {
    Lossy {
        quality: u8,
        effort: Option<u8>,
    },
    LosslessPalette {
        colors: u16,
        quality: u8,
        dither: bool,
        compression_level: u8,
    },
    LosslessTrueColor {
        compression_level: u8,
    },
    NearLossless {
        quality: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingProfile {
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub params: EncodingParams,
}

impl EncodingParams {
    pub fn quality(&self) -> Option<u8> {
        match *self {
            Self::Lossy { quality, .. }
            | Self::LosslessPalette { quality, .. }
            | Self::NearLossless { quality } => Some(quality),
            Self::LosslessTrueColor { .. } => None,
        }
    }

    pub fn compression_level(&self) -> Option<u8> {
        match *self {
            Self::LosslessPalette {
                compression_level, ..
            }
            | Self::LosslessTrueColor { compression_level } => Some(compression_level),
            Self::Lossy { .. } | Self::NearLossless { .. } => None,
        }
    }
}

impl EncodingProfile {
    pub fn quality(&self) -> Option<u8> {
        self.params.quality()
    }

    pub fn palette_colors(&self) -> Option<u16> {
        match self.params {
            EncodingParams::LosslessPalette { colors, .. } => Some(colors),
            _ => None,
        }
    }
}

/// Caller-supplied encoder settings for a save. When present it replaces the
/// inferred profile outright; unset fields take the target format's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingOverride {
    pub quality: Option<u8>,
    pub compression_level: Option<u8>,
    pub effort: Option<u8>,
    pub palette: Option<bool>,
    pub colors: Option<u16>,
    pub dither: Option<bool>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl EncodingOverride {
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_compression_level(mut self, level: u8) -> Self {
        self.compression_level = Some(level);
        self
    }

    pub fn with_effort(mut self, effort: u8) -> Self {
        self.effort = Some(effort);
        self
    }

    pub fn with_palette(mut self, colors: u16) -> Self {
        self.palette = Some(true);
        self.colors = Some(colors);
        self
    }

    pub fn with_dither(mut self, dither: bool) -> Self {
        self.dither = Some(dither);
        self
    }

    pub fn with_resize(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// A resolved reference image. Lives only for the duration of one `generate` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub profile: Option<EncodingProfile>,
}

/// One generated image as it came off the wire: base64 data plus its MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedArtifact {
    pub path: PathBuf,
    pub profile: EncodingProfile,
}
