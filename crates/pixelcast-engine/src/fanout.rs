use std::sync::{mpsc, Arc};
use std::thread;

use pixelcast_contracts::images::ImagePayload;
use serde_json::Value;

use crate::error::{PixelcastError, Result};
use crate::gemini::{ImageModel, RemoteRequest};
use crate::response::parse_envelope;

pub const WORKER_THREAD_PREFIX: &str = "pixelcast-fanout-";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanOutOutput {
    pub images: Vec<ImagePayload>,
    pub text: String,
    /// Raw envelopes in request-index order.
    pub responses: Vec<Vec<Value>>,
}

/// Issues `count` identical single-candidate requests and merges them in
/// request-index order. One request runs on the caller's thread; more run one
/// worker thread each. The first failure wins and the rest are abandoned.
pub fn fan_out(
    model: &Arc<dyn ImageModel>,
    request: &RemoteRequest,
    count: usize,
) -> Result<FanOutOutput> {
    if count == 0 {
        return Err(PixelcastError::InvalidRequest(
            "image count must be at least 1".to_string(),
        ));
    }
    if count == 1 {
        let chunks = model.generate(request)?;
        return Ok(merge_envelopes(vec![chunks]));
    }

    let shared_request = Arc::new(request.clone());
    let (tx, rx) = mpsc::channel::<(usize, Result<Vec<Value>>)>();
    for index in 0..count {
        let model = Arc::clone(model);
        let request = Arc::clone(&shared_request);
        let tx = tx.clone();
        thread::Builder::new()
            .name(format!("{WORKER_THREAD_PREFIX}{index}"))
            .spawn(move || {
                let outcome = model.generate(&request);
                // The receiver is gone once another slot has failed.
                let _ = tx.send((index, outcome));
            })
            .map_err(|source| PixelcastError::WorkerSpawn { index, source })?;
    }
    drop(tx);

    let mut slots: Vec<Option<Vec<Value>>> = vec![None; count];
    let mut filled = 0;
    while filled < count {
        let (index, outcome) = rx.recv().map_err(|_| {
            PixelcastError::RemoteGeneration(
                "fan-out worker exited without reporting a result".to_string(),
            )
        })?;
        slots[index] = Some(outcome?);
        filled += 1;
    }

    Ok(merge_envelopes(slots.into_iter().flatten().collect()))
}

pub fn merge_envelopes(envelopes: Vec<Vec<Value>>) -> FanOutOutput {
    let mut merged = FanOutOutput::default();
    for chunks in envelopes {
        let parsed = parse_envelope(&chunks);
        merged.images.extend(parsed.images);
        append_distinct_text(&mut merged.text, &parsed.text);
        merged.responses.push(chunks);
    }
    merged
}

/// Substring check, so a text already contained in the merged output is dropped
/// even when it is not an exact repeat.
fn append_distinct_text(merged: &mut String, text: &str) {
    if text.trim().is_empty() || merged.contains(text) {
        return;
    }
    if !merged.is_empty() {
        merged.push('\n');
    }
    merged.push_str(text);
}
