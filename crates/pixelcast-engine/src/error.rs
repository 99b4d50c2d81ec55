use std::path::PathBuf;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PixelcastError {
    #[error("missing credential: none of {0} is set")]
    MissingCredential(String),

    #[error("invalid reference image format: {0}")]
    InvalidReferenceFormat(String),

    #[error("failed to download reference image from {url}")]
    ReferenceDownload {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read reference image {}", path.display())]
    ReferenceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote generation failed: {0}")]
    RemoteGeneration(String),

    #[error("remote generation request failed ({endpoint})")]
    RemoteTransport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unsupported output format '{0}' (expected jpg, jpeg, png, webp, avif, tif or tiff)")]
    UnsupportedFormat(String),

    #[error("failed to persist {}", path.display())]
    PersistenceIo {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("failed to start fan-out worker {index}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PixelcastError>;

impl PixelcastError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        Self::PersistenceIo {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Flattens an error and its causes into one line, skipping repeated messages.
pub fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut cursor: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = cursor {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty()
            && !parts
                .last()
                .map(|existing| existing == trimmed)
                .unwrap_or(false)
        {
            parts.push(trimmed.to_string());
        }
        cursor = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
