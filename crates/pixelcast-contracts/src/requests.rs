use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::images::{EncodingOverride, EncodingProfile, ImagePayload, SavedArtifact};

/// Where a reference image comes from. Strings are classified at resolution
/// time: data URI, `http(s)` URL, or local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceSource {
    Bytes(Vec<u8>),
    Text(String),
}

impl From<Vec<u8>> for ReferenceSource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for ReferenceSource {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<String> for ReferenceSource {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ReferenceSource {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<PathBuf> for ReferenceSource {
    fn from(value: PathBuf) -> Self {
        Self::Text(value.to_string_lossy().to_string())
    }
}

impl From<&Path> for ReferenceSource {
    fn from(value: &Path) -> Self {
        Self::Text(value.to_string_lossy().to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    #[default]
    Standard,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub reference: Option<ReferenceSource>,
    pub count: u32,
    pub quality: QualityTier,
    pub aspect_ratio: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference: None,
            count: 1,
            quality: QualityTier::default(),
            aspect_ratio: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<ReferenceSource>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_quality(mut self, quality: QualityTier) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(aspect_ratio.into());
        self
    }
}

/// Merged output of one `generate` call. Immutable once returned; `save`
/// consumes it by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub generation_id: String,
    pub prompt: String,
    pub images: Vec<ImagePayload>,
    pub text: String,
    /// Raw response chunks, one list per sub-request in request order.
    pub responses: Vec<Vec<Value>>,
    pub reference_profile: Option<EncodingProfile>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOptions {
    pub directory: PathBuf,
    pub filename: Option<String>,
    pub extension: String,
    pub profile: Option<EncodingOverride>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            filename: None,
            extension: "png".to_string(),
            profile: None,
        }
    }
}

impl SaveOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_profile(mut self, profile: EncodingOverride) -> Self {
        self.profile = Some(profile);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub artifacts: Vec<SavedArtifact>,
    pub warnings: Vec<String>,
}

impl SaveOutcome {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.artifacts
            .iter()
            .map(|artifact| artifact.path.clone())
            .collect()
    }
}
