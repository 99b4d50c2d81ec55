pub mod error;
pub mod fanout;
pub mod gemini;
pub mod metadata;
pub mod persist;
pub mod response;
pub mod source;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use pixelcast_contracts::events::{EventPayload, EventWriter};
use pixelcast_contracts::requests::{
    GenerationRequest, GenerationResult, ReferenceSource, SaveOptions, SaveOutcome,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub(crate) use base64::engine::general_purpose::STANDARD as BASE64;

pub use error::{error_chain_text, PixelcastError, Result};
pub use fanout::{fan_out, FanOutOutput};
pub use gemini::{GeminiConfig, GeminiModel, ImageModel, RemoteRequest};
pub use metadata::infer_profile;
pub use persist::{save_images, save_images_reporting};
pub use response::{parse_envelope, ParsedResponse};
pub use source::{resolve_reference, HttpFetcher, ReferenceFetcher, ResolvedReference};

const EVENT_ERROR_CHARS: usize = 512;

/// Prompt (+ optional reference) in, saved files out. Holds no per-call state:
/// every `generate` returns its own [`GenerationResult`] and `save` takes one
/// explicitly.
#[derive(Clone)]
pub struct ImagePipeline {
    model: Arc<dyn ImageModel>,
    fetcher: Arc<dyn ReferenceFetcher>,
    events: Option<EventWriter>,
}

impl ImagePipeline {
    pub fn new(model: Arc<dyn ImageModel>) -> Self {
        Self {
            model,
            fetcher: Arc::new(HttpFetcher::new()),
            events: None,
        }
    }

    pub fn gemini(config: GeminiConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(GeminiModel::new(config)?)))
    }

    pub fn from_env() -> Result<Self> {
        Self::gemini(GeminiConfig::from_env()?)
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ReferenceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let generation_id = Uuid::new_v4().to_string();
        self.emit(
            "generation_started",
            Some(&generation_id),
            json!({
                "model": self.model.name(),
                "prompt": request.prompt,
                "count": request.count,
                "quality": request.quality,
                "aspect_ratio": request.aspect_ratio,
                "has_reference": request.reference.is_some(),
            }),
        );

        match self.run_generation(&generation_id, request) {
            Ok(result) => {
                self.emit(
                    "generation_finished",
                    Some(&generation_id),
                    json!({
                        "images": result.images.len(),
                        "text_chars": result.text.chars().count(),
                        "warnings": result.warnings,
                    }),
                );
                Ok(result)
            }
            Err(err) => {
                self.emit(
                    "generation_failed",
                    Some(&generation_id),
                    json!({ "error": error_chain_text(&err, EVENT_ERROR_CHARS) }),
                );
                Err(err)
            }
        }
    }

    fn run_generation(
        &self,
        generation_id: &str,
        request: &GenerationRequest,
    ) -> Result<GenerationResult> {
        if request.count == 0 {
            return Err(PixelcastError::InvalidRequest(
                "image count must be at least 1".to_string(),
            ));
        }

        let mut warnings = Vec::new();
        let resolved = match request.reference.as_ref() {
            Some(source) => Some(self.resolve(generation_id, source, &mut warnings)?),
            None => None,
        };
        let reference = resolved.as_ref().map(|resolved| &resolved.image);

        let remote = RemoteRequest::from_generation(request, reference, &mut warnings);
        let merged = fan_out(&self.model, &remote, request.count as usize)?;

        Ok(GenerationResult {
            generation_id: generation_id.to_string(),
            prompt: request.prompt.clone(),
            images: merged.images,
            text: merged.text,
            responses: merged.responses,
            reference_profile: reference.and_then(|image| image.profile),
            warnings,
        })
    }

    fn resolve(
        &self,
        generation_id: &str,
        source: &ReferenceSource,
        warnings: &mut Vec<String>,
    ) -> Result<ResolvedReference> {
        let resolved = resolve_reference(source, self.fetcher.as_ref())?;
        self.emit(
            "reference_resolved",
            Some(generation_id),
            json!({
                "origin": resolved.origin.as_str(),
                "mime_type": resolved.image.mime_type,
                "bytes": resolved.image.bytes.len(),
            }),
        );
        if let Some(profile) = resolved.image.profile.as_ref() {
            self.emit(
                "metadata_inferred",
                Some(generation_id),
                json!({ "profile": profile }),
            );
        }
        if let Some(error) = resolved.inference_error.as_ref() {
            push_unique_warning(
                warnings,
                format!("Reference encoding could not be inferred: {error}"),
            );
            self.emit(
                "metadata_inference_failed",
                Some(generation_id),
                json!({ "error": error }),
            );
        }
        Ok(resolved)
    }

    pub fn save(&self, result: &GenerationResult, options: &SaveOptions) -> Result<SaveOutcome> {
        let generation_id = Some(result.generation_id.as_str()).filter(|id| !id.is_empty());
        let mut written = Vec::new();
        let saved = save_images_reporting(result, options, |artifact| {
            written.push(artifact.path.to_string_lossy().to_string());
            self.emit(
                "artifact_saved",
                generation_id,
                json!({
                    "path": artifact.path.to_string_lossy(),
                    "mime_type": artifact.profile.format.mime_type(),
                    "profile": artifact.profile,
                }),
            );
        });
        match saved {
            Ok(outcome) => {
                if outcome.artifacts.is_empty() {
                    self.emit(
                        "save_skipped",
                        generation_id,
                        json!({ "warnings": outcome.warnings }),
                    );
                }
                Ok(outcome)
            }
            Err(err) => {
                self.emit(
                    "save_failed",
                    generation_id,
                    json!({
                        "directory": options.directory.to_string_lossy(),
                        "extension": options.extension,
                        "written": written,
                        "error": error_chain_text(&err, EVENT_ERROR_CHARS),
                    }),
                );
                Err(err)
            }
        }
    }

    /// Logging never fails the operation it describes.
    fn emit(&self, event_type: &str, generation_id: Option<&str>, payload: Value) {
        if let Some(events) = self.events.as_ref() {
            let _ = events.emit(event_type, generation_id, map_object(payload));
        }
    }
}

pub(crate) fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

fn map_object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
