use pixelcast_contracts::images::{ImagePayload, DEFAULT_MIME_TYPE};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub images: Vec<ImagePayload>,
    pub text: String,
}

/// Walks chunks → candidates → parts in order. Parts without inline image data
/// or text are skipped; an envelope with nothing recognisable parses to empty.
pub fn parse_envelope(chunks: &[Value]) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();
    for chunk in chunks {
        let candidates = chunk
            .get("candidates")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for part in parts {
                if let Some(image) = inline_image(part) {
                    parsed.images.push(image);
                } else if let Some(text) = part.get("text").and_then(Value::as_str) {
                    parsed.text.push_str(text);
                }
            }
        }
    }
    parsed
}

fn inline_image(part: &Value) -> Option<ImagePayload> {
    let inline = part
        .get("inlineData")
        .or_else(|| part.get("inline_data"))?;
    let data = inline
        .get("data")
        .and_then(Value::as_str)
        .filter(|data| !data.is_empty())?;
    let mime_type = inline
        .get("mimeType")
        .or_else(|| inline.get("mime_type"))
        .and_then(Value::as_str)
        .filter(|mime| !mime.trim().is_empty())
        .unwrap_or(DEFAULT_MIME_TYPE);
    Some(ImagePayload {
        mime_type: mime_type.to_string(),
        data: data.to_string(),
    })
}
