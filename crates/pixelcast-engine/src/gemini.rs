use std::env;

use base64::Engine as _;
use pixelcast_contracts::images::ReferenceImage;
use pixelcast_contracts::requests::{GenerationRequest, QualityTier};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::error::{truncate_text, PixelcastError, Result};
use crate::{push_unique_warning, BASE64};

pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_API_KEY"];
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image";

const SUPPORTED_RATIOS: [(&str, f64); 10] = [
    ("1:1", 1.0),
    ("2:3", 2.0 / 3.0),
    ("3:2", 3.0 / 2.0),
    ("3:4", 3.0 / 4.0),
    ("4:3", 4.0 / 3.0),
    ("4:5", 4.0 / 5.0),
    ("5:4", 5.0 / 4.0),
    ("9:16", 9.0 / 16.0),
    ("16:9", 16.0 / 9.0),
    ("21:9", 21.0 / 9.0),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

/// One self-contained call to the remote model. Always asks for a single candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    pub prompt: String,
    pub reference: Option<InlineImage>,
    pub image_size: String,
    pub aspect_ratio: Option<String>,
}

impl RemoteRequest {
    pub fn from_generation(
        request: &GenerationRequest,
        reference: Option<&ReferenceImage>,
        warnings: &mut Vec<String>,
    ) -> Self {
        Self {
            prompt: request.prompt.clone(),
            reference: reference.map(|image| InlineImage {
                mime_type: image.mime_type.clone(),
                data: BASE64.encode(&image.bytes),
            }),
            image_size: image_size_for_quality(request.quality).to_string(),
            aspect_ratio: request
                .aspect_ratio
                .as_deref()
                .and_then(|raw| nearest_supported_ratio(raw, warnings)),
        }
    }
}

/// The remote generation boundary. Returns the response envelope as a list of
/// chunks; a non-streamed response is a single chunk.
pub trait ImageModel: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &RemoteRequest) -> Result<Vec<Value>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiConfig {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    pub stream: bool,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            stream: false,
        }
    }

    /// `GEMINI_API_KEY`, then `GOOGLE_API_KEY`; `GEMINI_API_BASE` and
    /// `GEMINI_IMAGE_MODEL` override the defaults.
    pub fn from_env() -> Result<Self> {
        let api_key = API_KEY_ENV_VARS
            .iter()
            .find_map(|key| non_empty_env(key))
            .ok_or_else(|| PixelcastError::MissingCredential(API_KEY_ENV_VARS.join(", ")))?;
        let mut config = Self::new(api_key);
        if let Some(api_base) = non_empty_env("GEMINI_API_BASE") {
            config = config.with_api_base(api_base);
        }
        if let Some(model) = non_empty_env("GEMINI_IMAGE_MODEL") {
            config = config.with_model(model);
        }
        Ok(config)
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

pub struct GeminiModel {
    config: GeminiConfig,
    http: HttpClient,
}

impl GeminiModel {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(PixelcastError::MissingCredential(API_KEY_ENV_VARS.join(", ")));
        }
        Ok(Self {
            config,
            http: HttpClient::new(),
        })
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        let trimmed = self.config.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        let method = if self.config.stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        format!("{}/{}:{}", self.config.api_base, model_path, method)
    }
}

impl ImageModel for GeminiModel {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &RemoteRequest) -> Result<Vec<Value>> {
        let endpoint = self.endpoint();
        let payload = build_payload(request);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&payload)
            .send()
            .map_err(|source| PixelcastError::RemoteTransport {
                endpoint: endpoint.clone(),
                source,
            })?;
        response_chunks_or_error(&endpoint, response)
    }
}

pub fn build_payload(request: &RemoteRequest) -> Value {
    let mut parts = Vec::new();
    if let Some(reference) = request.reference.as_ref() {
        parts.push(json!({
            "inlineData": {
                "mimeType": reference.mime_type,
                "data": reference.data,
            }
        }));
    }
    parts.push(json!({ "text": request.prompt }));

    let mut image_config = Map::new();
    if let Some(aspect_ratio) = request.aspect_ratio.as_ref() {
        image_config.insert("aspectRatio".to_string(), Value::String(aspect_ratio.clone()));
    }
    image_config.insert(
        "imageSize".to_string(),
        Value::String(request.image_size.clone()),
    );

    json!({
        "contents": [{
            "role": "user",
            "parts": parts,
        }],
        "generationConfig": {
            "candidateCount": 1,
            "responseModalities": ["TEXT", "IMAGE"],
            "imageConfig": Value::Object(image_config),
        },
    })
}

fn response_chunks_or_error(endpoint: &str, response: HttpResponse) -> Result<Vec<Value>> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|source| PixelcastError::RemoteTransport {
            endpoint: endpoint.to_string(),
            source,
        })?;
    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .as_ref()
            .and_then(remote_error_message)
            .unwrap_or_else(|| truncate_text(&body, 512));
        return Err(PixelcastError::RemoteGeneration(format!(
            "HTTP {code}: {message}"
        )));
    }

    let parsed: Value = serde_json::from_str(&body).map_err(|err| {
        PixelcastError::RemoteGeneration(format!("invalid JSON payload: {err}"))
    })?;
    let chunks = match parsed {
        Value::Array(rows) => rows,
        other => vec![other],
    };
    if let Some(message) = chunks.iter().find_map(remote_error_message) {
        return Err(PixelcastError::RemoteGeneration(message));
    }
    Ok(chunks)
}

/// `{"error": {"message": ..}}` as reported by the API, in an error body or a stream chunk.
fn remote_error_message(payload: &Value) -> Option<String> {
    let error = payload
        .as_array()
        .and_then(|rows| rows.iter().find_map(|row| row.get("error")))
        .or_else(|| payload.get("error"))?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Some(message)
}

pub fn image_size_for_quality(quality: QualityTier) -> &'static str {
    match quality {
        QualityTier::Low => "1K",
        QualityTier::Standard => "2K",
        QualityTier::High => "4K",
    }
}

/// Snaps `W:H`, `WxH` or a keyword onto the closest ratio the model accepts.
pub fn nearest_supported_ratio(raw: &str, warnings: &mut Vec<String>) -> Option<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return None;
    }
    match normalized.as_str() {
        "portrait" | "tall" => return Some("9:16".to_string()),
        "landscape" | "wide" => return Some("16:9".to_string()),
        "square" => return Some("1:1".to_string()),
        _ => {}
    }

    let target_ratio = if let Some((left, right)) = parse_ratio(&normalized) {
        let direct = format!("{left}:{right}");
        if SUPPORTED_RATIOS
            .iter()
            .any(|(candidate, _)| *candidate == direct)
        {
            return Some(direct);
        }
        left as f64 / right as f64
    } else if let Some((width, height)) = parse_dims(&normalized) {
        width as f64 / height as f64
    } else {
        push_unique_warning(
            warnings,
            format!("Ignored unrecognised aspect ratio '{}'.", raw.trim()),
        );
        return None;
    };

    let mut best_key = "1:1";
    let mut best_delta = f64::MAX;
    for (key, ratio) in SUPPORTED_RATIOS {
        let delta = (ratio - target_ratio).abs();
        if delta < best_delta {
            best_key = key;
            best_delta = delta;
        }
    }
    push_unique_warning(warnings, format!("Aspect ratio snapped to {best_key}."));
    Some(best_key.to_string())
}

fn parse_dims(raw: &str) -> Option<(u32, u32)> {
    let (left, right) = raw.split_once('x')?;
    let width = left.trim().parse::<u32>().ok()?;
    let height = right.trim().parse::<u32>().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

fn parse_ratio(raw: &str) -> Option<(u32, u32)> {
    let (left, right) = if let Some(parts) = raw.split_once(':') {
        parts
    } else {
        raw.split_once('/')?
    };
    let first = left.trim().parse::<u32>().ok()?;
    let second = right.trim().parse::<u32>().ok()?;
    if first == 0 || second == 0 {
        return None;
    }
    Some((first, second))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;

    fn remote_request() -> RemoteRequest {
        RemoteRequest {
            prompt: "a lighthouse at dusk".to_string(),
            reference: Some(InlineImage {
                mime_type: "image/jpeg".to_string(),
                data: "cmVm".to_string(),
            }),
            image_size: "2K".to_string(),
            aspect_ratio: Some("16:9".to_string()),
        }
    }

    fn model_for(server: &mockito::Server, stream: bool) -> anyhow::Result<GeminiModel> {
        let config = GeminiConfig::new("test-key")
            .with_api_base(format!("{}/v1beta/", server.url()))
            .with_model("gemini-test")
            .with_stream(stream);
        Ok(GeminiModel::new(config)?)
    }

    #[test]
    fn payload_puts_reference_before_prompt_and_fixes_candidate_count() {
        let payload = build_payload(&remote_request());
        let parts = &payload["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[0]["inlineData"]["data"], "cmVm");
        assert_eq!(parts[1]["text"], "a lighthouse at dusk");
        assert_eq!(payload["generationConfig"]["candidateCount"], 1);
        assert_eq!(
            payload["generationConfig"]["imageConfig"],
            json!({"aspectRatio": "16:9", "imageSize": "2K"})
        );
    }

    #[test]
    fn payload_without_reference_or_ratio_is_text_only() {
        let mut request = remote_request();
        request.reference = None;
        request.aspect_ratio = None;
        let payload = build_payload(&request);
        let parts = payload["contents"][0]["parts"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        assert_eq!(parts.len(), 1);
        assert!(payload["generationConfig"]["imageConfig"]
            .get("aspectRatio")
            .is_none());
    }

    #[test]
    fn from_generation_encodes_reference_and_hints() {
        let request = GenerationRequest::new("boat")
            .with_quality(QualityTier::High)
            .with_aspect_ratio("1536x1024");
        let reference = ReferenceImage {
            bytes: b"ref".to_vec(),
            mime_type: "image/png".to_string(),
            profile: None,
        };
        let mut warnings = Vec::new();
        let remote = RemoteRequest::from_generation(&request, Some(&reference), &mut warnings);
        assert_eq!(remote.image_size, "4K");
        assert_eq!(remote.aspect_ratio.as_deref(), Some("3:2"));
        assert_eq!(
            remote.reference,
            Some(InlineImage {
                mime_type: "image/png".to_string(),
                data: "cmVm".to_string(),
            })
        );
        assert_eq!(warnings, vec!["Aspect ratio snapped to 3:2.".to_string()]);
    }

    #[test]
    fn aspect_ratio_snapping() {
        let mut warnings = Vec::new();
        assert_eq!(
            nearest_supported_ratio("16:9", &mut warnings).as_deref(),
            Some("16:9")
        );
        assert_eq!(
            nearest_supported_ratio("portrait", &mut warnings).as_deref(),
            Some("9:16")
        );
        assert!(warnings.is_empty());

        assert_eq!(
            nearest_supported_ratio("17:9", &mut warnings).as_deref(),
            Some("16:9")
        );
        assert_eq!(nearest_supported_ratio("wat", &mut warnings), None);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn quality_tiers_map_to_size_hints() {
        assert_eq!(image_size_for_quality(QualityTier::Low), "1K");
        assert_eq!(image_size_for_quality(QualityTier::Standard), "2K");
        assert_eq!(image_size_for_quality(QualityTier::High), "4K");
    }

    #[test]
    fn empty_key_is_a_missing_credential() {
        let result = GeminiModel::new(GeminiConfig::new("  "));
        assert!(matches!(result, Err(PixelcastError::MissingCredential(_))));
    }

    #[test]
    fn generate_posts_payload_and_returns_single_chunk() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/v1beta/models/gemini-test:generateContent")
            .match_query(Matcher::UrlEncoded("key".into(), "test-key".into()))
            .match_body(Matcher::PartialJson(json!({
                "generationConfig": {"candidateCount": 1}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "candidates": [{"content": {"parts": [{"text": "done"}]}}]
                })
                .to_string(),
            )
            .create();

        let chunks = model_for(&server, false)?.generate(&remote_request())?;
        mock.assert();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["candidates"][0]["content"]["parts"][0]["text"], "done");
        Ok(())
    }

    #[test]
    fn streaming_endpoint_returns_every_chunk() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/v1beta/models/gemini-test:streamGenerateContent")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!([{"candidates": []}, {"candidates": []}]).to_string())
            .create();

        let chunks = model_for(&server, true)?.generate(&remote_request())?;
        assert_eq!(chunks.len(), 2);
        Ok(())
    }

    #[test]
    fn http_errors_surface_the_remote_message() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/v1beta/models/gemini-test:generateContent")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(json!({"error": {"code": 400, "message": "API key not valid"}}).to_string())
            .create();

        let err = model_for(&server, false)?
            .generate(&remote_request())
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "remote generation failed: HTTP 400: API key not valid");
        Ok(())
    }

    #[test]
    fn error_chunk_in_successful_stream_fails_the_request() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/v1beta/models/gemini-test:streamGenerateContent")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!([{"candidates": []}, {"error": {"message": "quota exhausted"}}]).to_string(),
            )
            .create();

        let result = model_for(&server, true)?.generate(&remote_request());
        assert!(matches!(
            result,
            Err(PixelcastError::RemoteGeneration(message)) if message == "quota exhausted"
        ));
        Ok(())
    }

    #[test]
    fn unreachable_endpoint_is_a_transport_error() -> anyhow::Result<()> {
        let config = GeminiConfig::new("test-key").with_api_base("http://127.0.0.1:9");
        let result = GeminiModel::new(config)?.generate(&remote_request());
        assert!(matches!(result, Err(PixelcastError::RemoteTransport { .. })));
        Ok(())
    }
}
