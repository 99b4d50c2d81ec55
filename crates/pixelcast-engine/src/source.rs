use std::fs;
use std::path::Path;

use base64::Engine as _;
use pixelcast_contracts::images::{ReferenceImage, ALLOWED_MIME_TYPES, DEFAULT_MIME_TYPE};
use pixelcast_contracts::requests::ReferenceSource;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;

use crate::error::{truncate_text, PixelcastError, Result};
use crate::metadata::infer_profile;
use crate::BASE64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedReference {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Network seam for URL-sourced reference images.
pub trait ReferenceFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FetchedReference>;
}

/// Plain `GET` over blocking `reqwest`. Relies on the client's own timeouts.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    http: HttpClient,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: HttpClient) -> Self {
        Self { http }
    }
}

impl ReferenceFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedReference> {
        let download_error = |source| PixelcastError::ReferenceDownload {
            url: url.to_string(),
            source,
        };
        let response = self
            .http
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(download_error)?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().map_err(download_error)?.to_vec();
        Ok(FetchedReference {
            bytes,
            content_type,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceOrigin {
    Bytes,
    DataUri,
    Url,
    File,
}

impl ReferenceOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bytes => "bytes",
            Self::DataUri => "data_uri",
            Self::Url => "url",
            Self::File => "file",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedReference {
    pub image: ReferenceImage,
    pub origin: ReferenceOrigin,
    /// Set when a local file was read but its encoding profile could not be inferred.
    pub inference_error: Option<String>,
}

/// Normalises a reference source into bytes + MIME type. Only local files are
/// run through metadata inference.
pub fn resolve_reference(
    source: &ReferenceSource,
    fetcher: &dyn ReferenceFetcher,
) -> Result<ResolvedReference> {
    let raw = match source {
        ReferenceSource::Bytes(bytes) => {
            return Ok(plain(bytes.clone(), DEFAULT_MIME_TYPE, ReferenceOrigin::Bytes));
        }
        ReferenceSource::Text(raw) => raw.trim(),
    };

    if raw.starts_with("data:image") {
        let (bytes, mime_type) = parse_data_uri(raw)?;
        return Ok(plain(bytes, &mime_type, ReferenceOrigin::DataUri));
    }

    if is_http_url(raw) {
        let fetched = fetcher.fetch(raw)?;
        let mime_type = normalize_mime(fetched.content_type.as_deref());
        return Ok(plain(fetched.bytes, &mime_type, ReferenceOrigin::Url));
    }

    let path = Path::new(raw);
    let bytes = fs::read(path).map_err(|source| PixelcastError::ReferenceRead {
        path: path.to_path_buf(),
        source,
    })?;
    let mime_type = mime_for_path(path).unwrap_or(DEFAULT_MIME_TYPE);
    let (profile, inference_error) = match infer_profile(&bytes) {
        Ok(profile) => (Some(profile), None),
        Err(err) => (None, Some(truncate_text(&format!("{err:#}"), 240))),
    };
    Ok(ResolvedReference {
        image: ReferenceImage {
            bytes,
            mime_type: mime_type.to_string(),
            profile,
        },
        origin: ReferenceOrigin::File,
        inference_error,
    })
}

fn plain(bytes: Vec<u8>, mime_type: &str, origin: ReferenceOrigin) -> ResolvedReference {
    ResolvedReference {
        image: ReferenceImage {
            bytes,
            mime_type: mime_type.to_string(),
            profile: None,
        },
        origin,
        inference_error: None,
    }
}

/// Accepts exactly `data:image/<subtype>;base64,<payload>`.
fn parse_data_uri(raw: &str) -> Result<(Vec<u8>, String)> {
    let invalid = |reason: &str| {
        PixelcastError::InvalidReferenceFormat(format!(
            "{reason} in data URI '{}'",
            truncate_text(raw, 48)
        ))
    };

    let rest = raw
        .strip_prefix("data:image/")
        .ok_or_else(|| invalid("missing image/ media type"))?;
    let (subtype, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| invalid("missing ;base64, marker"))?;
    let subtype_ok = !subtype.is_empty()
        && subtype
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '+' | '-'));
    if !subtype_ok {
        return Err(invalid("malformed image subtype"));
    }
    if payload.is_empty() {
        return Err(invalid("empty payload"));
    }
    let bytes = BASE64
        .decode(payload.as_bytes())
        .map_err(|_| invalid("undecodable base64 payload"))?;
    let mime_type = normalize_mime(Some(&format!("image/{subtype}")));
    Ok((bytes, mime_type))
}

fn is_http_url(raw: &str) -> bool {
    let lowered = raw
        .get(..8)
        .unwrap_or(raw)
        .to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

/// Maps a content-type (parameters allowed) onto the MIME allow-list.
pub fn normalize_mime(raw: Option<&str>) -> String {
    let base = raw
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let base = if base == "image/jpg" {
        "image/jpeg".to_string()
    } else {
        base
    };
    if ALLOWED_MIME_TYPES.contains(&base.as_str()) {
        base
    } else {
        DEFAULT_MIME_TYPE.to_string()
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}
